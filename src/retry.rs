use std::time::Duration;

use crate::error::Error;

pub const SETTLE_ATTEMPTS: usize = 3;
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Shell exit code for "command not found"; never worth retrying.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Run `op` up to three times with a one-second sleep between attempts.
///
/// Kernel-side device settling (LVM and loop devices especially) makes
/// the first attempt of partition-table related commands unreliable; a
/// later success masks the earlier failures. Exit 127 means the
/// executable itself is missing and short-circuits immediately.
/// Exhausting all attempts reports the last failure.
pub fn with_settling_retries(
    sleep: impl Fn(Duration),
    mut op: impl FnMut() -> Result<(), Error>,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if e.exit_code() == Some(EXIT_COMMAND_NOT_FOUND) => return Err(e),
            Err(e) if attempt == SETTLE_ATTEMPTS => return Err(e),
            Err(_) => sleep(SETTLE_DELAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn command_failed(code: i32) -> Error {
        Error::CommandFailed {
            command: "partprobe /dev/sda".to_string(),
            code: Some(code),
        }
    }

    #[test]
    fn test_success_after_transient_failures_is_masked() {
        let attempts = Cell::new(0);
        let sleeps = Cell::new(0);
        let result = with_settling_retries(
            |_| sleeps.set(sleeps.get() + 1),
            || {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(command_failed(1))
                } else {
                    Ok(())
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(attempts.get(), 3);
        assert_eq!(sleeps.get(), 2);
    }

    #[test]
    fn test_exhaustion_reports_last_failure() {
        let attempts = Cell::new(0);
        let sleeps = Cell::new(0);
        let result = with_settling_retries(
            |_| sleeps.set(sleeps.get() + 1),
            || {
                attempts.set(attempts.get() + 1);
                Err(command_failed(1))
            },
        );
        assert_eq!(result.unwrap_err().exit_code(), Some(1));
        assert_eq!(attempts.get(), 3);
        assert_eq!(sleeps.get(), 2);
    }

    #[test]
    fn test_command_not_found_short_circuits() {
        let attempts = Cell::new(0);
        let sleeps = Cell::new(0);
        let result = with_settling_retries(
            |_| sleeps.set(sleeps.get() + 1),
            || {
                attempts.set(attempts.get() + 1);
                Err(command_failed(EXIT_COMMAND_NOT_FOUND))
            },
        );
        assert_eq!(result.unwrap_err().exit_code(), Some(127));
        assert_eq!(attempts.get(), 1);
        assert_eq!(sleeps.get(), 0);
    }
}
