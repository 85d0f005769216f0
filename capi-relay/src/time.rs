use time::OffsetDateTime;

pub trait TimeSource {
    fn now(&self) -> OffsetDateTime;

    // Return an RFC 3339 timestamp
    fn current_time(&self) -> String {
        self.now()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Frozen clock, used by tests to get stable event ids and timestamps.
#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl TimeSource for FixedTime {
    fn now(&self) -> OffsetDateTime {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn fixed_time_formats_as_rfc3339() {
        let clock = FixedTime {
            time: datetime!(2024-05-01 12:30:00 UTC),
        };

        assert_eq!(clock.current_time(), "2024-05-01T12:30:00Z");
    }
}
