use std::time::SystemTime;

pub trait OptionInspectNone<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        match &self {
            Some(_) => (),
            None => inspector_function(),
        }
        self
    }
}

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_millis() as u64
}

/// Clamps a percentage into `[0, 100]`, mapping NaN to zero.
pub fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_percentage() {
        assert_eq!(clamp_percentage(-3.0), 0.0);
        assert_eq!(clamp_percentage(42.5), 42.5);
        assert_eq!(clamp_percentage(250.0), 100.0);
        assert_eq!(clamp_percentage(f64::NAN), 0.0);
    }

    #[test]
    fn test_inspect_none_only_runs_on_none() {
        let mut called = 0;
        let _ = Some(1).inspect_none(|| called += 1);
        assert_eq!(called, 0);
        let _ = None::<u8>.inspect_none(|| called += 1);
        assert_eq!(called, 1);
    }
}
