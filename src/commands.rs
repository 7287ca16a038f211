pub mod fields {
    use crate::output;

    /// Search and output the known telemetry field codes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only output fields whose variable, name, description or code
        /// contain this string.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce output")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize, Clone)]
    pub struct FieldSchema {
        pub code: u8,
        pub variable: &'static str,
        pub name: &'static str,
        pub multiplier: Option<f64>,
        pub units: &'static str,
        pub description: &'static str,
    }

    impl FieldSchema {
        pub fn all_fields() -> impl Iterator<Item = Self> {
            use crate::fields::*;
            use std::iter::zip;
            zip(
                zip(zip(zip(zip(CODES, VARIABLES), NAMES), MULTIPLIERS), UNITS),
                DESCRIPTIONS,
            )
            .map(
                |(((((&code, &variable), &name), &multiplier), &units), &description)| {
                    FieldSchema { code, variable, name, multiplier, units, description }
                },
            )
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let upper = pattern.to_uppercase();
            if self.variable.to_uppercase().contains(&upper) {
                return true;
            }
            if self.name.to_uppercase().contains(&upper) {
                return true;
            }
            if self.description.to_uppercase().contains(&upper) {
                return true;
            }
            if format!("{:#04x}", self.code).contains(&pattern.to_lowercase()) {
                return true;
            }
            return false;
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output(vec![
            "Code",
            "Variable",
            "Name",
            "Multiplier",
            "Units",
            "Description",
        ])?;
        for field in FieldSchema::all_fields() {
            if let Some(pattern) = &args.filter {
                if !field.is_match(pattern) {
                    continue;
                }
            }
            output.emit(
                vec![
                    format!("{:#04x}", field.code),
                    field.variable.to_string(),
                    field.name.to_string(),
                    field.multiplier.map(|m| m.to_string()).unwrap_or_default(),
                    field.units.to_string(),
                    field.description.to_string(),
                ],
                &field,
            )?;
        }
        output.commit()?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::FieldSchema;

        #[test]
        fn schema_covers_the_whole_catalog() {
            assert_eq!(FieldSchema::all_fields().count(), crate::fields::CODES.len());
        }

        #[test]
        fn filter_matches_variable_and_code() {
            let temp = FieldSchema::all_fields().next().unwrap();
            assert!(temp.is_match("temp"));
            assert!(temp.is_match("0x00"));
            assert!(!temp.is_match("voltage"));
        }
    }
}

pub mod poll {
    use crate::connection::{self, Connection};
    use crate::session::{Reading, Schedule, Session};
    use crate::{mqtt, output};
    use tracing::info;

    /// Discover the inverters on the bus and poll their telemetry forever.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,

        /// Time to wait between telemetry polling passes.
        #[arg(long, default_value = "9s")]
        poll_interval: humantime::Duration,

        /// Run another device-discovery cycle whenever this much time has
        /// passed since the previous one.
        ///
        /// Already-registered devices keep their addresses; the cycle only
        /// picks up inverters that appeared (or re-appeared) on the bus.
        #[arg(long, default_value = "1m")]
        reregister_interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the bus connection")]
        Connect(#[source] connection::Error),
        #[error("bus session failed")]
        Session(#[from] crate::session::Error),
        #[error("could not produce output")]
        Output(#[from] output::Error),
        #[error("could not set up the MQTT publisher")]
        Mqtt(#[from] mqtt::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(run_loop(args))
    }

    fn reading_row(reading: &Reading) -> Vec<String> {
        vec![
            reading.device.clone(),
            reading.timestamp.to_string(),
            reading
                .values
                .iter()
                .map(|(variable, value)| format!("{variable}={value}"))
                .collect::<Vec<_>>()
                .join(" "),
        ]
    }

    async fn run_loop(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output(vec!["Device", "Timestamp", "Values"])?;
        let publisher = mqtt::Publisher::from_args(&args.mqtt)?;
        let connection = Connection::open(&args.connection).map_err(Error::Connect)?;
        let mut session = Session::new(connection);
        let mut schedule = Schedule::new(*args.poll_interval, *args.reregister_interval);

        session.reset_bus().await?;
        session.register_cycle().await?;

        loop {
            for reading in session.poll_all().await? {
                info!(message = "reading", line = %reading.kv_line());
                output.emit(reading_row(&reading), &reading)?;
                if let Some(publisher) = &publisher {
                    publisher.publish(&reading).await;
                }
            }
            output.checkpoint()?;
            if schedule.pass_complete().await {
                session.register_cycle().await?;
            }
        }
    }
}
