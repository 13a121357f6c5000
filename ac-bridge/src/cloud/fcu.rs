//! FCU state codec.
//!
//! The vendor reports and accepts a unit's state as 38 hex characters: twenty
//! one-byte fields, except merit B and merit A which share one byte as two
//! nibbles. `0xff` (nibble `f`) means "no value".

use crate::models::{FieldMap, FieldValue};

pub const NONE: u8 = 0xff;
/// "Unknown" for temperatures and plain numbers.
const UNKNOWN: u8 = 0x7f;
const FIELD_COUNT: usize = 20;
const MERIT_B: usize = 6;
const MERIT_A: usize = 7;
pub const HEX_LEN: usize = 38;

/// Setpoints are reported 16 degrees high in HEAT mode with the 8°C heating feature.
const HEATING_8C_OFFSET: i64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FcuError {
    #[error("state too short: {0} hex characters")]
    TooShort(usize),
    #[error("state is not hex: {0:?}")]
    NotHex(String),
    #[error("{field}: unknown code 0x{code:02x}")]
    UnknownCode { field: &'static str, code: u8 },
    #[error("unknown field {0}")]
    UnknownField(String),
    #[error("{field}: invalid value {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Enum(&'static [(&'static str, u8)]),
    Temperature,
    Number,
}

struct FieldSpec {
    name: &'static str,
    kind: Kind,
    settable: bool,
}

const STATUS: &[(&str, u8)] = &[("ON", 0x30), ("OFF", 0x31), ("INVALID", 0x02)];

const MODE: &[(&str, u8)] = &[
    ("AUTO", 0x41),
    ("COOL", 0x42),
    ("HEAT", 0x43),
    ("DRY", 0x44),
    ("FAN", 0x45),
    ("INVALID", 0x00),
];

const FAN_MODE: &[(&str, u8)] = &[
    ("AUTO", 0x41),
    ("QUIET", 0x31),
    ("LOW", 0x32),
    ("MEDIUM_LOW", 0x33),
    ("MEDIUM", 0x34),
    ("MEDIUM_HIGH", 0x35),
    ("HIGH", 0x36),
    ("INVALID", 0x00),
];

const SWING_MODE: &[(&str, u8)] = &[
    ("NOT_USED", 0x31),
    ("SWING_VERTICAL", 0x41),
    ("SWING_HORIZONTAL", 0x42),
    ("SWING_VERTICAL_AND_HORIZONTAL", 0x43),
    ("FIXED_1", 0x50),
    ("FIXED_2", 0x51),
    ("FIXED_3", 0x52),
    ("FIXED_4", 0x53),
    ("FIXED_5", 0x54),
    ("INVALID", 0x00),
];

const POWER_SELECTION: &[(&str, u8)] =
    &[("POWER_50", 0x32), ("POWER_75", 0x4b), ("POWER_100", 0x64)];

const MERIT_B_FEATURE: &[(&str, u8)] =
    &[("FIREPLACE_1", 0x02), ("FIREPLACE_2", 0x03), ("OFF", 0x00)];

const MERIT_A_FEATURE: &[(&str, u8)] = &[
    ("HIGH_POWER", 0x01),
    ("CDU_SILENT_1", 0x02),
    ("ECO", 0x03),
    ("HEATING_8C", 0x04),
    ("SLEEP_CARE", 0x05),
    ("FLOOR", 0x06),
    ("COMFORT", 0x07),
    ("CDU_SILENT_2", 0x0a),
    ("OFF", 0x00),
];

const AIR_PURE_ION: &[(&str, u8)] = &[("OFF", 0x10), ("ON", 0x18)];
const SELF_CLEANING: &[(&str, u8)] = &[("ON", 0x18), ("OFF", 0x10)];
const ON_OFF: &[(&str, u8)] = &[("ON", 0x01), ("OFF", 0x02)];

const TIMER_MODE: &[(&str, u8)] = &[
    ("OFF", 0x01),
    ("TIMER1", 0x02),
    ("ON", 0x03),
    ("TIMER2", 0x04),
    ("ONOFF", 0x05),
    ("TIMER3", 0x06),
    ("TIMER4", 0x09),
    ("TIMER5", 0x0a),
    ("TIMER6", 0x0b),
];

const ERROR: &[(&str, u8)] = &[
    ("OK_0", 0x00),
    ("OK", 0xfe),
    ("FAULT_COM", 0x01),
    ("FAULT_CTRL_OUTER", 0x02),
    ("FAULT_OTHER_OUTER", 0x03),
    ("FAULT_SERIAL_INNER", 0x04),
    ("FAULT_COMP_OPEN", 0x07),
    ("FAULT_TA_OC", 0x0c),
    ("FAULT_TC_OC", 0x0d),
    ("FAULT_TCJ_OC", 0x0f),
    ("FAULT_FAN_IN_BLOCK", 0x11),
    ("FAULT_CTRL_IN", 0x12),
    ("FAULT_INVT_OVERCUR", 0x14),
    ("FAULT_COMP_SC", 0x16),
    ("FAULT_CTRL_OUT_OVERCUR", 0x17),
    ("FAULT_TE_TS_OC", 0x18),
    ("FAULT_TD_OC", 0x19),
    ("FAULT_FAN_OUT_BLOCK", 0x1a),
    ("FAULT_TE", 0x1b),
    ("FAULT_COMP_BLOCK", 0x1c),
    ("FAULT_COMP_PHASE", 0x1d),
    ("FAULT_TEMP_COMP_117", 0x1e),
    ("FAULT_COMP_VOLT", 0x1f),
    ("FAULT_HIGH_PRES", 0x21),
    ("FAULT_STATE", 0x34),
    ("FAULT_DESCRIPTION", 0x35),
];

const fn field(name: &'static str, kind: Kind, settable: bool) -> FieldSpec {
    FieldSpec { name, kind, settable }
}

// Wire order.
const FIELDS: [FieldSpec; FIELD_COUNT] = [
    field("ac_status", Kind::Enum(STATUS), true),
    field("ac_mode", Kind::Enum(MODE), true),
    field("ac_temperature", Kind::Temperature, true),
    field("ac_fan_mode", Kind::Enum(FAN_MODE), true),
    field("ac_swing_mode", Kind::Enum(SWING_MODE), true),
    field("ac_power_selection", Kind::Enum(POWER_SELECTION), true),
    field("ac_merit_b_feature", Kind::Enum(MERIT_B_FEATURE), true),
    field("ac_merit_a_feature", Kind::Enum(MERIT_A_FEATURE), true),
    field("ac_air_pure_ion", Kind::Enum(AIR_PURE_ION), true),
    field("ac_indoor_temperature", Kind::Temperature, false),
    field("ac_outdoor_temperature", Kind::Temperature, false),
    field("ac_error", Kind::Enum(ERROR), false),
    field("ac_timer_mode", Kind::Enum(TIMER_MODE), false),
    field("ac_relative_hours", Kind::Number, false),
    field("ac_relative_minutes", Kind::Number, false),
    field("ac_self_cleaning", Kind::Enum(SELF_CLEANING), false),
    field("ac_led", Kind::Enum(ON_OFF), false),
    field("ac_scheduler", Kind::Enum(ON_OFF), false),
    field("ac_utc_hours", Kind::Number, false),
    field("ac_utc_minutes", Kind::Number, false),
];

const STATUS_IDX: usize = 0;
const MODE_IDX: usize = 1;
const TEMPERATURE_IDX: usize = 2;
const SELF_CLEANING_IDX: usize = 15;

const STATUS_ON: u8 = 0x30;
const MODE_HEAT: u8 = 0x43;
const MERIT_A_HEATING_8C: u8 = 0x04;
const MERIT_A_FLOOR: u8 = 0x06;
const MERIT_OFF: u8 = 0x00;
const SELF_CLEANING_ON: u8 = 0x18;
const SELF_CLEANING_OFF: u8 = 0x10;

/// Names of the fields a command may carry.
pub fn command_fields() -> impl Iterator<Item = &'static str> {
    FIELDS.iter().filter(|f| f.settable).map(|f| f.name)
}

fn decode_temperature(byte: u8) -> Option<i64> {
    match byte {
        NONE | UNKNOWN => None,
        0x7e => Some(-1),
        0x80..=0xfe => Some(i64::from(byte) - 256),
        _ => Some(i64::from(byte)),
    }
}

fn encode_temperature(degrees: i64) -> Option<u8> {
    match degrees {
        -1 => Some(0x7e),
        -128..=-2 => u8::try_from(degrees + 256).ok(),
        0..=0x7d => u8::try_from(degrees).ok(),
        _ => None,
    }
}

fn nibble(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcuState {
    bytes: [u8; FIELD_COUNT],
}

impl Default for FcuState {
    fn default() -> Self {
        Self { bytes: [NONE; FIELD_COUNT] }
    }
}

impl FcuState {
    /// Decodes the first 38 hex characters; anything after them is ignored.
    pub fn decode(hex: &str) -> Result<Self, FcuError> {
        let raw = hex.as_bytes();
        if raw.len() < HEX_LEN {
            return Err(FcuError::TooShort(raw.len()));
        }
        let digits: Option<Vec<u8>> = raw[..HEX_LEN].iter().map(|&c| nibble(c)).collect();
        let digits = digits.ok_or_else(|| FcuError::NotHex(hex.to_string()))?;

        let mut bytes = [NONE; FIELD_COUNT];
        let full_byte = |i: usize| (digits[i] << 4) | digits[i + 1];
        let half_byte = |d: u8| if d == 0x0f { NONE } else { d };

        for (idx, byte) in bytes.iter_mut().enumerate().take(MERIT_B) {
            *byte = full_byte(idx * 2);
        }
        bytes[MERIT_B] = half_byte(digits[12]);
        bytes[MERIT_A] = half_byte(digits[13]);
        for (idx, byte) in bytes.iter_mut().enumerate().skip(MERIT_A + 1) {
            *byte = full_byte(idx * 2 - 2);
        }
        Ok(Self { bytes })
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(HEX_LEN);
        for (idx, byte) in self.bytes.iter().enumerate() {
            if idx == MERIT_B || idx == MERIT_A {
                out.push_str(&format!("{:x}", byte & 0x0f));
            } else {
                out.push_str(&format!("{byte:02x}"));
            }
        }
        out
    }

    fn raw(&self, idx: usize) -> Option<u8> {
        let byte = self.bytes[idx];
        (byte != NONE).then_some(byte)
    }

    fn heating_8c_active(&self) -> bool {
        self.raw(MODE_IDX) == Some(MODE_HEAT) && self.raw(MERIT_A) == Some(MERIT_A_HEATING_8C)
    }

    /// Published view: the raw code for enumerations, integers otherwise.
    /// Fields without a value, or with an unknown one, are left out.
    pub fn to_fields(&self) -> Result<FieldMap, FcuError> {
        let mut fields = FieldMap::new();
        for (idx, desc) in FIELDS.iter().enumerate() {
            let Some(byte) = self.raw(idx) else { continue };
            let value = match desc.kind {
                Kind::Enum(table) => {
                    if !table.iter().any(|(_, code)| *code == byte) {
                        return Err(FcuError::UnknownCode { field: desc.name, code: byte });
                    }
                    FieldValue::from(i64::from(byte))
                }
                Kind::Temperature => {
                    let Some(mut degrees) = decode_temperature(byte) else { continue };
                    if idx == TEMPERATURE_IDX && self.heating_8c_active() {
                        degrees -= HEATING_8C_OFFSET;
                    }
                    FieldValue::from(degrees)
                }
                Kind::Number if byte == UNKNOWN => continue,
                Kind::Number => FieldValue::from(i64::from(byte)),
            };
            fields.insert(desc.name.to_string(), value);
        }
        Ok(fields)
    }

    /// Builds a sparse state from command fields. Only settable fields are accepted.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, FcuError> {
        let mut state = Self::default();
        for (name, value) in fields {
            let (idx, desc) = FIELDS
                .iter()
                .enumerate()
                .find(|(_, desc)| desc.settable && desc.name == name)
                .ok_or_else(|| FcuError::UnknownField(name.clone()))?;
            let invalid = || FcuError::InvalidValue { field: desc.name, value: value.to_string() };

            state.bytes[idx] = match desc.kind {
                Kind::Enum(table) => match value {
                    FieldValue::Text(text) => table
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case(text))
                        .map(|(_, code)| *code)
                        .ok_or_else(invalid)?,
                    FieldValue::Number(_) => value
                        .as_i64()
                        .and_then(|v| u8::try_from(v).ok())
                        .filter(|code| table.iter().any(|(_, c)| c == code))
                        .ok_or_else(invalid)?,
                    FieldValue::Bool(_) => return Err(invalid()),
                },
                Kind::Temperature => value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                    .and_then(encode_temperature)
                    .ok_or_else(invalid)?,
                Kind::Number => value
                    .as_i64()
                    .and_then(|v| u8::try_from(v).ok())
                    .filter(|b| *b != NONE)
                    .ok_or_else(invalid)?,
            };
        }
        Ok(state)
    }

    /// Applies every field of `update` that carries a value.
    pub fn merged(&self, update: &FcuState) -> FcuState {
        let mut out = *self;
        for (dst, src) in out.bytes.iter_mut().zip(update.bytes.iter()) {
            if *src != NONE {
                *dst = *src;
            }
        }
        out
    }

    /// Adjusts a requested state against the unit's current one before it is sent:
    /// setpoint offset in 8°C heating, merit features only valid while heating,
    /// and self-cleaning cleared when the unit is switched on.
    pub fn prepare_command(current: &FcuState, requested: FcuState) -> FcuState {
        let mut state = requested;
        let future = current.merged(&requested);

        if let Some(degrees) = state.raw(TEMPERATURE_IDX).and_then(decode_temperature) {
            if future.heating_8c_active() {
                if let Some(byte) = encode_temperature(degrees + HEATING_8C_OFFSET) {
                    state.bytes[TEMPERATURE_IDX] = byte;
                }
            }
        }

        if future.raw(MODE_IDX) != Some(MODE_HEAT) {
            state.bytes[MERIT_B] = MERIT_OFF;
            if matches!(future.raw(MERIT_A), Some(MERIT_A_HEATING_8C | MERIT_A_FLOOR)) {
                state.bytes[MERIT_A] = MERIT_OFF;
            }
        }

        let switching_on = state.raw(STATUS_IDX) == Some(STATUS_ON);
        if switching_on && current.raw(SELF_CLEANING_IDX) == Some(SELF_CLEANING_ON) {
            state.bytes[SELF_CLEANING_IDX] = SELF_CLEANING_OFF;
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cooling at 22°C, fan auto, swing off, 100% power, no merit features,
    // 31°C inside, 24°C outside, no error. Trailing characters are ignored.
    const COOLING: &str = "30421641316400101f18000100001001020a1effff";

    fn fields(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_decode_reported_state() {
        let state = FcuState::decode(COOLING).unwrap();
        let published = state.to_fields().unwrap();

        assert_eq!(published["ac_status"], 0x30.into());
        assert_eq!(published["ac_mode"], 0x42.into());
        assert_eq!(published["ac_temperature"], 22.into());
        assert_eq!(published["ac_fan_mode"], 0x41.into());
        assert_eq!(published["ac_swing_mode"], 0x31.into());
        assert_eq!(published["ac_power_selection"], 0x64.into());
        assert_eq!(published["ac_merit_b_feature"], 0.into());
        assert_eq!(published["ac_merit_a_feature"], 0.into());
        assert_eq!(published["ac_air_pure_ion"], 0x10.into());
        assert_eq!(published["ac_indoor_temperature"], 31.into());
        assert_eq!(published["ac_outdoor_temperature"], 24.into());
        assert_eq!(published["ac_error"], 0.into());
    }

    #[test]
    fn test_published_codes_are_accepted_back_as_commands() {
        let published = FcuState::decode(COOLING).unwrap().to_fields().unwrap();
        let command: FieldMap = published
            .into_iter()
            .filter(|(name, _)| command_fields().any(|f| f == name))
            .collect();
        let state = FcuState::from_fields(&command).unwrap();
        assert_eq!(state.raw(MODE_IDX), Some(0x42));
        assert_eq!(state.raw(STATUS_IDX), Some(STATUS_ON));
    }

    #[test]
    fn test_encode_is_inverse_of_decode() {
        let head = &COOLING[..HEX_LEN];
        assert_eq!(FcuState::decode(head).unwrap().encode(), head);
    }

    #[test]
    fn test_none_fields_are_omitted() {
        let empty = FcuState::default();
        assert_eq!(empty.encode(), "f".repeat(HEX_LEN));
        assert!(FcuState::decode(&empty.encode()).unwrap().to_fields().unwrap().is_empty());
    }

    #[test]
    fn test_negative_and_unknown_temperatures() {
        let mut state = FcuState::default();
        state.bytes[9] = 0xfb;
        state.bytes[10] = 0x7e;
        state.bytes[TEMPERATURE_IDX] = UNKNOWN;
        let published = state.to_fields().unwrap();
        assert_eq!(published["ac_indoor_temperature"], (-5).into());
        assert_eq!(published["ac_outdoor_temperature"], (-1).into());
        assert!(!published.contains_key("ac_temperature"));
    }

    #[test]
    fn test_unknown_plain_numbers_are_omitted() {
        let mut state = FcuState::default();
        state.bytes[13] = UNKNOWN;
        state.bytes[14] = 30;
        state.bytes[18] = UNKNOWN;
        let published = state.to_fields().unwrap();
        assert!(!published.contains_key("ac_relative_hours"));
        assert!(!published.contains_key("ac_utc_hours"));
        assert_eq!(published["ac_relative_minutes"], 30.into());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(FcuState::decode("3042"), Err(FcuError::TooShort(4)));
        assert!(matches!(FcuState::decode(&"zz".repeat(19)), Err(FcuError::NotHex(_))));

        let mut bad = FcuState::default();
        bad.bytes[MODE_IDX] = 0x99;
        assert_eq!(
            bad.to_fields(),
            Err(FcuError::UnknownCode { field: "ac_mode", code: 0x99 })
        );
    }

    #[test]
    fn test_command_from_names_and_codes() {
        let state = FcuState::from_fields(&fields(&[
            ("ac_mode", "heat".into()),
            ("ac_status", 0x30.into()),
            ("ac_temperature", "21".into()),
        ]))
        .unwrap();
        assert_eq!(state.raw(MODE_IDX), Some(MODE_HEAT));
        assert_eq!(state.raw(STATUS_IDX), Some(STATUS_ON));
        assert_eq!(state.raw(TEMPERATURE_IDX), Some(21));
        assert_eq!(state.raw(3), None);
    }

    #[test]
    fn test_command_rejects_bad_values_and_read_only_fields() {
        assert!(matches!(
            FcuState::from_fields(&fields(&[("ac_mode", "TURBO".into())])),
            Err(FcuError::InvalidValue { field: "ac_mode", .. })
        ));
        assert!(matches!(
            FcuState::from_fields(&fields(&[("ac_mode", true.into())])),
            Err(FcuError::InvalidValue { .. })
        ));
        assert_eq!(
            FcuState::from_fields(&fields(&[("ac_indoor_temperature", 20.into())])),
            Err(FcuError::UnknownField("ac_indoor_temperature".into()))
        );
        assert!(command_fields().any(|f| f == "ac_temperature"));
        assert!(!command_fields().any(|f| f == "ac_error"));
    }

    #[test]
    fn test_leaving_heat_clears_heating_only_merits() {
        let mut current = FcuState::decode(COOLING).unwrap();
        current.bytes[MODE_IDX] = MODE_HEAT;
        current.bytes[MERIT_A] = MERIT_A_FLOOR;
        current.bytes[MERIT_B] = 0x02;

        let requested = FcuState::from_fields(&fields(&[("ac_mode", "COOL".into())])).unwrap();
        let sent = FcuState::prepare_command(&current, requested);
        assert_eq!(sent.raw(MERIT_B), Some(MERIT_OFF));
        assert_eq!(sent.raw(MERIT_A), Some(MERIT_OFF));
    }

    #[test]
    fn test_heating_8c_setpoint_round_trip() {
        let mut current = FcuState::decode(COOLING).unwrap();
        current.bytes[MODE_IDX] = MODE_HEAT;
        current.bytes[MERIT_A] = MERIT_A_HEATING_8C;

        let requested = FcuState::from_fields(&fields(&[("ac_temperature", 8.into())])).unwrap();
        let sent = FcuState::prepare_command(&current, requested);
        assert_eq!(sent.raw(TEMPERATURE_IDX), Some(24));
        assert_eq!(sent.raw(MERIT_B), None);

        let reported = current.merged(&sent);
        assert_eq!(reported.to_fields().unwrap()["ac_temperature"], 8.into());
    }

    #[test]
    fn test_power_on_clears_self_cleaning() {
        let mut current = FcuState::decode(COOLING).unwrap();
        current.bytes[SELF_CLEANING_IDX] = SELF_CLEANING_ON;
        let requested = FcuState::from_fields(&fields(&[("ac_status", "ON".into())])).unwrap();

        let sent = FcuState::prepare_command(&current, requested);
        assert_eq!(sent.raw(SELF_CLEANING_IDX), Some(SELF_CLEANING_OFF));
    }
}
