//! The catalog of telemetry fields an Eversolar inverter can report.
//!
//! Devices label each telemetry slot with a one-byte field code in their
//! description-query response. The catalog maps those codes to variable
//! names, scaling multipliers and units. Codes absent from the catalog are
//! legal on the wire and decode as unlabeled raw words.

/// A decoded telemetry value.
///
/// Fields with a multiplier scale the raw word into physical units; fields
/// without one (counters, error bitmaps) pass the raw word through.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Raw(u16),
    Scaled(f64),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Raw(n) => f.write_fmt(format_args!("{}", n)),
            Value::Scaled(v) => f.write_fmt(format_args!("{}", v)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Raw(n) => serializer.serialize_u16(n),
            Value::Scaled(v) => serializer.serialize_f64(v),
        }
    }
}

/// Handle into the parallel catalog lists below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldIndex(usize);

impl FieldIndex {
    pub fn from_code(code: u8) -> Option<FieldIndex> {
        let index = CODES.partition_point(|v| *v < code);
        (index < CODES.len() && CODES[index] == code).then_some(Self(index))
    }

    pub fn from_variable(variable: &str) -> Option<FieldIndex> {
        let index = VARIABLES.iter().position(|v| *v == variable);
        index.map(Self)
    }

    pub fn code(&self) -> u8 {
        CODES[self.0]
    }

    pub fn variable(&self) -> &'static str {
        VARIABLES[self.0]
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }

    pub fn multiplier(&self) -> Option<f64> {
        MULTIPLIERS[self.0]
    }

    pub fn units(&self) -> &'static str {
        UNITS[self.0]
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTIONS[self.0]
    }

    /// Apply this field's multiplier to a raw telemetry word.
    pub fn value(&self, raw: u16) -> Value {
        match self.multiplier() {
            Some(multiplier) => Value::Scaled(f64::from(raw) * multiplier),
            None => Value::Raw(raw),
        }
    }
}

// Codes 0x40..0x7F describe a single-phase or R-phase inverter; 0x80..0xBF
// and 0xC0..0xFF repeat the same layout for the S and T phases of three-phase
// models and carry `_s`/`_t` variable suffixes so readings stay distinct.
macro_rules! for_each_field {
    ($m:ident) => {
        $m! {
            0x00: "temp", "Temperature", mult = 0.1, "°C", "Internal inverter temperature";
            0x01: "v_pv1", "Vpv1", mult = 0.1, "V", "PV1 voltage";
            0x02: "v_pv2", "Vpv2", mult = 0.1, "V", "PV2 voltage";
            0x04: "i_pv1", "Ipv1", mult = 0.1, "A", "PV1 current";
            0x05: "i_pv2", "Ipv2", mult = 0.1, "A", "PV2 current";
            0x07: "e_total_h", "E-Total_H", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0x08: "e_total_l", "E-Total_L", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0x09: "h_total_h", "H-Total_H", mult = 1.0, "Hr", "Total operation hours";
            0x0a: "h_total_l", "H-Total_L", mult = 1.0, "Hr", "Total operation hours";
            0x0b: "p_ac", "Pac", mult = 1.0, "W", "Total power to grid";
            0x0c: "mode", "Mode", mult = 1.0, "", "Operation Mode";
            0x0d: "e_today", "E-today", mult = 0.01, "KW.Hr", "The accumulated kWh of day";
            0x20: "sur_temp", "surTemp", mult = 0.1, "°C", "Ambient Temperature";
            0x21: "bd_temp", "bdTemp", mult = 0.1, "°C", "Panel Temperature";
            0x22: "irr", "irr", mult = 0.1, "W/m2", "Rad";
            0x23: "wind_speed", "windSpeed", mult = 0.1, "m/s", "Speed of wind";
            0x38: "waiting_time", "waitingTime", mult = 1.0, "s", "wait time on connection";
            0x39: "tmp_fault_value", "TmpFaultValue", mult = 0.1, "°C", "Temperature fault value";
            0x3a: "pv1_fault_value", "PV1FaultValue", mult = 0.1, "V", "PV1 voltage fault value";
            0x3b: "pv2_fault_value", "PV2FaultValue", mult = 0.1, "V", "PV2 voltage fault value";
            0x3d: "gfci_fault_value", "GFCIFaultValue", mult = 0.001, "A", "GFCI current fault value";
            0x3e: "error_msg_h", "ErrorMessageH", "", "Failure description for status";
            0x3f: "error_msg_l", "ErrorMessageL", "", "Failure description for status";
            0x40: "v_pv", "Vpv", mult = 0.1, "V", "PV voltage";
            0x41: "i_pv1_r", "Ipv1", mult = 0.1, "A", "PV current";
            0x42: "v_ac", "Vac", mult = 0.1, "V", "Grid voltage";
            0x43: "f_ac", "Fac", mult = 0.01, "Hz", "Grid frequency";
            0x44: "p_ac_r", "Pac", mult = 1.0, "W", "Power to grid";
            0x45: "z_ac", "Zac", mult = 0.001, "Ω", "Grid Impedance";
            0x46: "i_pv", "Ipv", mult = 0.1, "A", "PV current";
            0x47: "e_total_h_r", "E-Total_H", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0x48: "e_total_l_r", "E-Total_L", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0x49: "h_total_h_r", "H-Total_H", mult = 1.0, "Hr", "Total operation hours";
            0x4a: "h_total_l_r", "H-Total_L", mult = 1.0, "Hr", "Total operation hours";
            0x4b: "power_on", "Power_On", "", "Number of times the inverter starts feeding the grid";
            0x4c: "mode_r", "Mode", mult = 1.0, "", "Operation Mode";
            0x78: "gv_fault_value", "GVFaultValue", mult = 0.1, "V", "Grid Voltage Fault Value";
            0x79: "gf_fault_value", "GFFaultValue", mult = 0.01, "Hz", "Grid Frequency Fault Value";
            0x7a: "gz_fault_value", "GZFaultValue", mult = 0.001, "Ω", "Grid Impedance Fault Value";
            0x7b: "tmp_fault_value_r", "TmpFaultValue", mult = 0.1, "°C", "Temperature Fault Value";
            0x7c: "pv1_fault_value_r", "PV1FaultValue", mult = 0.1, "V", "PV1 voltage fault value";
            0x7d: "gfci_fault_value_r", "GFCIFaultValue", mult = 0.1, "A", "GFCI current fault value";
            0x7e: "error_msg_h_r", "ErrorMessageH", "", "Failure description for status";
            0x7f: "error_msg_l_r", "ErrorMessageL", "", "Failure description for status";
            0x80: "v_pv_s", "Vpv", mult = 0.1, "V", "PV voltage";
            0x81: "i_pv1_s", "Ipv1", mult = 0.1, "A", "PV current";
            0x82: "v_ac_s", "Vac", mult = 0.1, "V", "Grid voltage";
            0x83: "f_ac_s", "Fac", mult = 0.01, "Hz", "Grid frequency";
            0x84: "p_ac_s", "Pac", mult = 1.0, "W", "Power to grid";
            0x85: "z_ac_s", "Zac", mult = 0.001, "Ω", "Grid Impedance";
            0x86: "i_pv_s", "Ipv", mult = 0.1, "A", "PV current";
            0x87: "e_total_h_s", "E-Total_H", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0x88: "e_total_l_s", "E-Total_L", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0x89: "h_total_h_s", "H-Total_H", mult = 1.0, "Hr", "Total operation hours";
            0x8a: "h_total_l_s", "H-Total_L", mult = 1.0, "Hr", "Total operation hours";
            0x8b: "power_on_s", "Power_On", "", "Number of times the inverter starts feeding the grid";
            0x8c: "mode_s", "Mode", mult = 1.0, "", "Operation Mode";
            0xb8: "gv_fault_value_s", "GVFaultValue", mult = 0.1, "V", "Grid Voltage Fault Value";
            0xb9: "gf_fault_value_s", "GFFaultValue", mult = 0.01, "Hz", "Grid Frequency Fault Value";
            0xba: "gz_fault_value_s", "GZFaultValue", mult = 0.001, "Ω", "Grid Impedance Fault Value";
            0xbb: "tmp_fault_value_s", "TmpFaultValue", mult = 0.1, "°C", "Temperature Fault Value";
            0xbc: "pv1_fault_value_s", "PV1FaultValue", mult = 0.1, "V", "PV1 voltage fault value";
            0xbd: "gfci_fault_value_s", "GFCIFaultValue", mult = 0.1, "A", "GFCI current fault value";
            0xbe: "error_msg_h_s", "ErrorMessageH", "", "Failure description for status";
            0xbf: "error_msg_l_s", "ErrorMessageL", "", "Failure description for status";
            0xc0: "v_pv_t", "Vpv", mult = 0.1, "V", "PV voltage";
            0xc1: "i_pv1_t", "Ipv1", mult = 0.1, "A", "PV current";
            0xc2: "v_ac_t", "Vac", mult = 0.1, "V", "Grid voltage";
            0xc3: "f_ac_t", "Fac", mult = 0.01, "Hz", "Grid frequency";
            0xc4: "p_ac_t", "Pac", mult = 1.0, "W", "Power to grid";
            0xc5: "z_ac_t", "Zac", mult = 0.001, "Ω", "Grid Impedance";
            0xc6: "i_pv_t", "Ipv", mult = 0.1, "A", "PV current";
            0xc7: "e_total_h_t", "E-Total_H", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0xc8: "e_total_l_t", "E-Total_L", mult = 0.1, "KW.Hr", "Total Energy to grid";
            0xc9: "h_total_h_t", "H-Total_H", mult = 1.0, "Hr", "Total operation hours";
            0xca: "h_total_l_t", "H-Total_L", mult = 1.0, "Hr", "Total operation hours";
            0xcb: "power_on_t", "Power_On", "", "Number of times the inverter starts feeding the grid";
            0xcc: "mode_t", "Mode", mult = 1.0, "", "Operation Mode";
            0xf8: "gv_fault_value_t", "GVFaultValue", mult = 0.1, "V", "Grid Voltage Fault Value";
            0xf9: "gf_fault_value_t", "GFFaultValue", mult = 0.01, "Hz", "Grid Frequency Fault Value";
            0xfa: "gz_fault_value_t", "GZFaultValue", mult = 0.001, "Ω", "Grid Impedance Fault Value";
            0xfb: "tmp_fault_value_t", "TmpFaultValue", mult = 0.1, "°C", "Temperature Fault Value";
            0xfc: "pv1_fault_value_t", "PV1FaultValue", mult = 0.1, "V", "PV1 voltage fault value";
            0xfd: "gfci_fault_value_t", "GFCIFaultValue", mult = 0.1, "A", "GFCI current fault value";
            0xfe: "error_msg_h_t", "ErrorMessageH", "", "Failure description for status";
            0xff: "error_msg_l_t", "ErrorMessageL", "", "Failure description for status";
        }
    };
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! make_lists {
    ($($code: literal: $var: literal, $name: literal, $(mult = $mult: literal,)? $units: literal, $descr: literal;)+) => {
        pub static CODES: &[u8] = &[$($code),*];
        pub static VARIABLES: &[&str] = &[$($var),*];
        pub static NAMES: &[&str] = &[$($name),*];
        pub static MULTIPLIERS: &[Option<f64>] = &[$(optional!($($mult)?)),*];
        pub static UNITS: &[&str] = &[$($units),*];
        pub static DESCRIPTIONS: &[&str] = &[$($descr),*];
    };
}

for_each_field!(make_lists);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_strictly_ascending() {
        for pair in CODES.windows(2) {
            assert!(pair[0] < pair[1], "{:#04x} !< {:#04x}", pair[0], pair[1]);
        }
    }

    #[test]
    fn lists_are_parallel() {
        assert_eq!(CODES.len(), VARIABLES.len());
        assert_eq!(CODES.len(), NAMES.len());
        assert_eq!(CODES.len(), MULTIPLIERS.len());
        assert_eq!(CODES.len(), UNITS.len());
        assert_eq!(CODES.len(), DESCRIPTIONS.len());
    }

    #[test]
    fn lookup_known_code() {
        let field = FieldIndex::from_code(0x00).unwrap();
        assert_eq!(field.variable(), "temp");
        assert_eq!(field.units(), "°C");
        assert_eq!(field.multiplier(), Some(0.1));
    }

    #[test]
    fn lookup_unknown_code() {
        assert!(FieldIndex::from_code(0x03).is_none());
        assert!(FieldIndex::from_code(0x0e).is_none());
    }

    #[test]
    fn lookup_by_variable() {
        let field = FieldIndex::from_variable("v_pv1").unwrap();
        assert_eq!(field.code(), 0x01);
    }

    #[test]
    fn multiplier_scales_raw_word() {
        let temp = FieldIndex::from_code(0x00).unwrap();
        let Value::Scaled(v) = temp.value(1234) else {
            panic!("temp should scale");
        };
        assert!((v - 123.4).abs() < 1e-9);
    }

    #[test]
    fn missing_multiplier_passes_raw_word_through() {
        let error_msg = FieldIndex::from_code(0x3e).unwrap();
        assert_eq!(error_msg.value(500), Value::Raw(500));
    }
}
