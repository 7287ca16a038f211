//! Record-oriented output to the terminal or a file.
//!
//! Used both for one-shot listings (the `fields` command) and for the
//! endless polling loop, which checkpoints after every pass so that records
//! reach the sink without waiting for process exit.

use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    /// Human-readable table. The polling loop prints one table per pass.
    Table,
    /// One JSON object per line.
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the output to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_output(self, headers: Vec<&'static str>) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<dyn std::io::Write>,
        };
        let mut output = Output {
            formatter: match &self.format {
                Format::Table => Formatter::Table { comfy: fresh_table(&headers) },
                Format::Jsonl => Formatter::Jsonl,
                Format::Csv => Formatter::Csv { writer: csv_core::Writer::new() },
            },
            headers,
            args: self,
            io,
        };
        if let Formatter::Csv { .. } = output.formatter {
            let headers = output.headers.clone();
            output.write_csv_row(&headers)?;
        }
        Ok(output)
    }
}

fn fresh_table(headers: &[&'static str]) -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    comfy.set_header(headers.to_vec());
    comfy
}

pub struct Output {
    args: Args,
    headers: Vec<&'static str>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { writer: csv_core::Writer },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    /// Emit one record.
    ///
    /// Table and CSV sinks render `table_row`; the JSONL sink serializes
    /// `record` instead.
    pub fn emit<R: serde::Serialize>(
        &mut self,
        table_row: Vec<String>,
        record: &R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { .. } => {}
            Formatter::Table { comfy } => {
                comfy.add_row(table_row);
                return Ok(());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, record).map_err(Error::SerializeJson)?;
                return writeln!(self.io).map_err(|e| self.write_error(e));
            }
        }
        self.write_csv_row(&table_row)
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        let Formatter::Csv { writer } = &mut self.formatter else {
            unreachable!("write_csv_row on a non-csv formatter");
        };
        let io = &mut self.io;
        let path = &self.args.output;
        let write_error = |e| match path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        };
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut buffer = vec![0; max_len];
        for value in values {
            let inp = value.as_bytes();
            let (WriteResult::InputEmpty, consumed, written) = writer.field(inp, &mut buffer)
            else {
                panic!("something wrong with csv output");
            };
            assert_eq!(value.len(), consumed);
            io.write_all(&buffer[..written]).map_err(write_error)?;
            let (WriteResult::InputEmpty, written) = writer.delimiter(&mut buffer) else {
                panic!("something wrong with csv output");
            };
            io.write_all(&buffer[..written]).map_err(write_error)?;
        }
        let (WriteResult::InputEmpty, written) = writer.terminator(&mut buffer) else {
            panic!("something wrong with csv output");
        };
        io.write_all(&buffer[..written]).map_err(write_error)
    }

    /// Push everything buffered so far to the sink.
    ///
    /// For the table format this renders the accumulated rows and starts a
    /// fresh table; the streaming formats only flush the writer.
    pub fn checkpoint(&mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &mut self.formatter {
            if comfy.row_iter().next().is_some() {
                let comfy = std::mem::replace(comfy, fresh_table(&self.headers));
                self.io
                    .write_fmt(format_args!("{comfy}\n"))
                    .map_err(|e| self.write_error(e))?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    /// Render anything still buffered and flush the sink.
    pub fn commit(mut self) -> Result<(), Error> {
        self.checkpoint()
    }
}
