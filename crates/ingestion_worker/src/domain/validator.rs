use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use common::domain::{fields, ValidatedReading, ValidationError};
use serde_json::{Map, Value};

/// Validate a raw transport payload into a `ValidatedReading`.
///
/// The payload must be a UTF-8 JSON object carrying `device_id`,
/// `timestamp_utc`, `temperature_celsius` and `humidity_percent`. `now` becomes
/// the reading's processing timestamp. Nothing is logged here; the caller
/// decides what to do with a rejection.
pub fn validate(payload: &[u8], now: DateTime<Utc>) -> Result<ValidatedReading, ValidationError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ValidationError::MalformedPayload(format!("payload is not UTF-8: {}", e)))?;

    let value: Value = serde_json::from_str(text)
        .map_err(|e| ValidationError::MalformedPayload(format!("invalid JSON: {}", e)))?;

    let object = value.as_object().ok_or_else(|| {
        ValidationError::MalformedPayload("payload is not a JSON object".to_string())
    })?;

    for field in fields::REQUIRED {
        if !object.contains_key(field) {
            return Err(ValidationError::MissingField(field));
        }
    }

    let device_id = coerce_device_id(field_value(object, fields::DEVICE_ID))?;
    let timestamp_utc = parse_timestamp(field_value(object, fields::TIMESTAMP_UTC))?;
    let temperature = coerce_f64(
        fields::TEMPERATURE_CELSIUS,
        field_value(object, fields::TEMPERATURE_CELSIUS),
    )?;
    let humidity = coerce_f64(
        fields::HUMIDITY_PERCENT,
        field_value(object, fields::HUMIDITY_PERCENT),
    )?;

    ValidatedReading::new(device_id, timestamp_utc, temperature, humidity, now)
}

// Presence is checked up front, so a missing key here can only mean null
fn field_value<'a>(object: &'a Map<String, Value>, field: &str) -> &'a Value {
    object.get(field).unwrap_or(&Value::Null)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn coerce_device_id(value: &Value) -> Result<String, ValidationError> {
    let device_id = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => {
            return Err(invalid(
                fields::DEVICE_ID,
                format!("expected a string, got {}", json_type(other)),
            ))
        }
    };

    if device_id.is_empty() {
        return Err(invalid(fields::DEVICE_ID, "device_id is empty"));
    }
    Ok(device_id)
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    let raw = value.as_str().ok_or_else(|| {
        invalid(
            fields::TIMESTAMP_UTC,
            format!("expected an ISO-8601 string, got {}", json_type(value)),
        )
    })?;

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    parse_iso8601(raw.trim())
        .ok_or_else(|| invalid(fields::TIMESTAMP_UTC, format!("'{}' is not ISO-8601", raw)))
}

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];
const CLOCK_FORMATS: [&str; 4] = ["%H:%M:%S%.f", "%H%M%S%.f", "%H:%M", "%H%M"];

/// Calendar-date ISO-8601 in extended or basic format.
///
/// The time may be reduced to minutes or hours, or left out entirely
/// (midnight). Date and time are split by `T` or a space. Offsets may be `Z`,
/// `±HH`, `±HHMM` or `±HH:MM`; without one the time is taken to be UTC.
fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    let (date, time) = match raw.find(['T', 't', ' ']) {
        Some(i) => (&raw[..i], Some(&raw[i + 1..])),
        None => (raw, None),
    };

    let date = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date, format).ok())?;

    let Some(time) = time else {
        return date.and_hms_opt(0, 0, 0).map(|midnight| midnight.and_utc());
    };

    let (clock, offset) = match time.find(['Z', 'z', '+', '-']) {
        Some(i) => (&time[..i], parse_offset(&time[i..])?),
        None => (time, FixedOffset::east_opt(0)?),
    };

    let local = date.and_time(parse_clock(clock)?);
    offset
        .from_local_datetime(&local)
        .single()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.replace(',', ".");
    if raw.len() == 2 {
        return NaiveTime::from_hms_opt(raw.parse().ok()?, 0, 0);
    }
    CLOCK_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(&raw, format).ok())
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    if raw.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }

    let sign = match raw.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits = raw[1..].replacen(':', "", 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let (hours, minutes) = match digits.len() {
        2 => (&digits[..], "00"),
        4 => (&digits[..2], &digits[2..]),
        _ => return None,
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn coerce_f64(field: &'static str, value: &Value) -> Result<f64, ValidationError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(field, format!("{} is not representable as a float", n))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(field, format!("'{}' is not a number", s))),
        other => Err(invalid(
            field,
            format!("expected a number, got {}", json_type(other)),
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
