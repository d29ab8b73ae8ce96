use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset};

pub fn localized_datetime(time: OffsetDateTime, tz: Tz) -> DateTime<Tz> {
    let utc = time.to_offset(UtcOffset::UTC);
    let seconds = utc.unix_timestamp();
    let nanos: u32 = utc.nanosecond();
    let datetime_utc = DateTime::<Utc>::from_timestamp(seconds, nanos)
        .or_else(|| DateTime::<Utc>::from_timestamp(seconds, 0))
        .unwrap_or_default();
    tz.from_utc_datetime(&datetime_utc.naive_utc())
}

/// Calendar day of `time` as seen in `tz`; this is the day-bucket of a task.
pub fn localized_date(time: OffsetDateTime, tz: Tz) -> Date {
    let localized = localized_datetime(time, tz);
    Month::try_from(localized.month() as u8)
        .ok()
        .and_then(|month| {
            let day = u8::try_from(localized.day()).ok()?;
            Date::from_calendar_date(localized.year(), month, day).ok()
        })
        .unwrap_or_else(|| time.to_offset(UtcOffset::UTC).date())
}

/// Half-open `[start, end)` instant range covering `date` in `tz`.
pub fn day_range(date: Date, tz: Tz) -> (OffsetDateTime, OffsetDateTime) {
    let start = local_midnight(date, tz);
    let end = date
        .next_day()
        .map(|next| local_midnight(next, tz))
        .unwrap_or(start + Duration::DAY);
    (start, end)
}

/// Half-open `[start, end)` instant range covering a calendar month in `tz`.
pub fn month_range(year: i32, month: Month, tz: Tz) -> (OffsetDateTime, OffsetDateTime) {
    let first = Date::from_calendar_date(year, month, 1).unwrap_or(Date::MIN);
    let (next_year, next_month) = if month == Month::December {
        (year + 1, Month::January)
    } else {
        (year, month.next())
    };
    let start = local_midnight(first, tz);
    let end = Date::from_calendar_date(next_year, next_month, 1)
        .map(|next| local_midnight(next, tz))
        .unwrap_or(start + Duration::days(31));
    (start, end)
}

fn local_midnight(date: Date, tz: Tz) -> OffsetDateTime {
    let fallback = date.midnight().assume_utc();
    let Some(naive) = NaiveDate::from_ymd_opt(date.year(), u32::from(u8::from(date.month())), u32::from(date.day()))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
    else {
        return fallback;
    };

    // Zones that skip midnight on DST changes start the day an hour later.
    let localized = tz
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest());

    localized
        .and_then(|value| {
            OffsetDateTime::from_unix_timestamp(value.timestamp())
                .ok()
                .map(|instant| instant + Duration::nanoseconds(i64::from(value.timestamp_subsec_nanos())))
        })
        .unwrap_or(fallback)
}
