//! Log message helpers.

use std::borrow::Cow;

pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Clips `message` to the configured formatting buffer size, appending a
/// visible marker when anything was cut. The clip point respects UTF-8
/// boundaries.
pub fn clip_log_message(message: &str, buffer_size: usize) -> Cow<'_, str> {
    if message.len() <= buffer_size {
        return Cow::Borrowed(message);
    }

    let mut cut = buffer_size.saturating_sub(TRUNCATION_MARKER.len());
    while cut > 0 && !message.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut clipped = String::with_capacity(buffer_size);
    clipped.push_str(&message[..cut]);
    clipped.push_str(TRUNCATION_MARKER);
    Cow::Owned(clipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(clip_log_message("fine", 64), "fine");
    }

    #[test]
    fn long_messages_get_marker() {
        let long = "x".repeat(100);
        let clipped = clip_log_message(&long, 32);
        assert_eq!(clipped.len(), 32);
        assert!(clipped.ends_with(TRUNCATION_MARKER));
    }
}
