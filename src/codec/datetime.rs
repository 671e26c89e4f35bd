//! Date, time and duration encoding.
//!
//! Timestamps count microseconds from 2000-01-01T00:00:00 UTC; dates count
//! days from 2000-01-01.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use super::value::{DateDuration, Duration, RelativeDuration};
use crate::error::{Error, ErrorKind, Result};
use crate::wire::buffer::ReadBuffer;

/// Microseconds between the Unix epoch and 2000-01-01.
const EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Days between the Unix epoch and 2000-01-01.
const EPOCH_OFFSET_DAYS: i64 = 10_957;

fn out_of_range(what: &str) -> Error {
    Error::new(
        ErrorKind::InvalidArgumentError,
        format!("{} value out of range", what),
    )
}

fn bad_data(what: &str) -> Error {
    Error::new(
        ErrorKind::ProtocolError,
        format!("{} value out of range", what),
    )
}

// ============================================================================
// datetime / local_datetime
// ============================================================================

pub(crate) fn encode_datetime(buf: &mut BytesMut, dt: &DateTime<Utc>) -> Result<()> {
    let micros = dt
        .timestamp_micros()
        .checked_sub(EPOCH_OFFSET_MICROS)
        .ok_or_else(|| out_of_range("datetime"))?;
    buf.put_i32(8);
    buf.put_i64(micros);
    Ok(())
}

pub(crate) fn decode_datetime(buf: &mut ReadBuffer) -> Result<DateTime<Utc>> {
    let micros = buf.read_i64()?;
    micros
        .checked_add(EPOCH_OFFSET_MICROS)
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| bad_data("datetime"))
}

pub(crate) fn encode_local_datetime(buf: &mut BytesMut, dt: &NaiveDateTime) -> Result<()> {
    encode_datetime(buf, &dt.and_utc())
}

pub(crate) fn decode_local_datetime(buf: &mut ReadBuffer) -> Result<NaiveDateTime> {
    Ok(decode_datetime(buf)?.naive_utc())
}

// ============================================================================
// local_date / local_time
// ============================================================================

pub(crate) fn encode_local_date(buf: &mut BytesMut, date: &NaiveDate) -> Result<()> {
    let days = date.signed_duration_since(NaiveDate::default()).num_days() - EPOCH_OFFSET_DAYS;
    let days = i32::try_from(days).map_err(|_| out_of_range("local_date"))?;
    buf.put_i32(4);
    buf.put_i32(days);
    Ok(())
}

pub(crate) fn decode_local_date(buf: &mut ReadBuffer) -> Result<NaiveDate> {
    let days = buf.read_i32()? as i64;
    NaiveDate::default()
        .checked_add_signed(chrono::Duration::days(days + EPOCH_OFFSET_DAYS))
        .ok_or_else(|| bad_data("local_date"))
}

pub(crate) fn encode_local_time(buf: &mut BytesMut, time: &NaiveTime) -> Result<()> {
    let micros = time.num_seconds_from_midnight() as i64 * 1_000_000
        + (time.nanosecond() as i64 / 1_000).min(999_999);
    buf.put_i32(8);
    buf.put_i64(micros);
    Ok(())
}

pub(crate) fn decode_local_time(buf: &mut ReadBuffer) -> Result<NaiveTime> {
    let micros = buf.read_i64()?;
    if micros < 0 {
        return Err(bad_data("local_time"));
    }
    let secs = u32::try_from(micros / 1_000_000).map_err(|_| bad_data("local_time"))?;
    let nanos = (micros % 1_000_000) as u32 * 1_000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or_else(|| bad_data("local_time"))
}

// ============================================================================
// durations
// ============================================================================

pub(crate) fn encode_duration(buf: &mut BytesMut, d: &Duration) -> Result<()> {
    buf.put_i32(16);
    buf.put_i64(d.micros);
    buf.put_i32(0);
    buf.put_i32(0);
    Ok(())
}

pub(crate) fn decode_duration(buf: &mut ReadBuffer) -> Result<Duration> {
    let micros = buf.read_i64()?;
    let days = buf.read_i32()?;
    let months = buf.read_i32()?;
    if days != 0 || months != 0 {
        return Err(Error::new(
            ErrorKind::ProtocolError,
            format!(
                "non-zero reserved bytes received in data: days {}, months {}",
                days, months
            ),
        ));
    }
    Ok(Duration::from_micros(micros))
}

pub(crate) fn encode_relative_duration(buf: &mut BytesMut, d: &RelativeDuration) -> Result<()> {
    buf.put_i32(16);
    buf.put_i64(d.micros);
    buf.put_i32(d.days);
    buf.put_i32(d.months);
    Ok(())
}

pub(crate) fn decode_relative_duration(buf: &mut ReadBuffer) -> Result<RelativeDuration> {
    let micros = buf.read_i64()?;
    let days = buf.read_i32()?;
    let months = buf.read_i32()?;
    Ok(RelativeDuration {
        months,
        days,
        micros,
    })
}

pub(crate) fn encode_date_duration(buf: &mut BytesMut, d: &DateDuration) -> Result<()> {
    buf.put_i32(16);
    buf.put_i64(0);
    buf.put_i32(d.days);
    buf.put_i32(d.months);
    Ok(())
}

pub(crate) fn decode_date_duration(buf: &mut ReadBuffer) -> Result<DateDuration> {
    buf.skip(8)?;
    let days = buf.read_i32()?;
    let months = buf.read_i32()?;
    Ok(DateDuration { months, days })
}
