use std::time::Duration;

pub const EMPTY_VALUE: &str = "---";

fn transform_u32_to_bytes(x: u32) -> [u8; 4] {
    x.to_be_bytes()
}

fn as_u16_be(array: [u8; 2]) -> u16 {
    (u16::from(array[0]) << 8) + u16::from(array[1])
}

/// Render a 4-byte value as two 16-bit halves when it exceeds the 2-byte range
/// E.g. 4259840100 -> "65000:100"
pub fn u32_to_dotted(value: u32, sep: char) -> String {
    if value < 65535 {
        format!("{}", value)
    } else {
        let bytes = transform_u32_to_bytes(value);
        format!(
            "{}{}{}",
            as_u16_be([bytes[0], bytes[1]]),
            sep,
            as_u16_be([bytes[2], bytes[3]])
        )
    }
}

fn fit_with_remainder(dividend: u64, divisor: u64) -> (u64, u64) {
    let fit = dividend / divisor;
    let remainder = dividend % divisor;
    (fit, remainder)
}

/// Given a duration, format like "00:00:00"
pub fn format_elapsed_time(elapsed: Duration) -> String {
    let (hours, remainder) = fit_with_remainder(elapsed.as_secs(), 3600);
    let (minutes, seconds) = fit_with_remainder(remainder, 60);
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

pub fn maybe_string<T>(item: Option<&T>) -> String
where
    T: ToString,
{
    item.map(std::string::ToString::to_string)
        .unwrap_or_else(|| String::from(EMPTY_VALUE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_to_dotted() {
        assert_eq!(u32_to_dotted(100, ':'), "100".to_string());
        assert_eq!(u32_to_dotted(4259840100, ':'), "65000:100".to_string());
        assert_eq!(u32_to_dotted(0xFFFF0007, ':'), "65535:7".to_string());
    }

    #[test]
    fn test_format_elapsed_time() {
        assert_eq!(format_elapsed_time(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_elapsed_time(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn test_maybe_string() {
        assert_eq!(maybe_string(Some(&42)), "42");
        assert_eq!(maybe_string::<u32>(None), EMPTY_VALUE);
    }
}
