//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_absolute_paths_untouched() {
        assert_eq!(expand_tilde("/var/lib/vtrund"), "/var/lib/vtrund");
    }

    #[test]
    fn leaves_mid_string_tilde_untouched() {
        assert_eq!(expand_tilde("/tmp/~not-home"), "/tmp/~not-home");
    }

    #[test]
    fn expands_leading_tilde_with_home_set() {
        std::env::set_var("HOME", "/home/test-user");
        assert_eq!(expand_tilde("~"), "/home/test-user");
        assert_eq!(expand_tilde("~/.vibetunnel/control"), "/home/test-user/.vibetunnel/control");
    }
}
