use crate::process::Cmd;

/// User-visible, line-oriented output. Everything the pipeline wants a
/// human to see goes through here; nothing is returned.
pub trait Messenger {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    /// Blank separator line after a group of related messages.
    fn info_gap(&self);
    /// Render a command line right before it is executed.
    fn announce_command(&self, cmd: &Cmd);
}

/// Messenger backed by the `log` macros, so verbosity and formatting
/// follow the logger configured in `main`.
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn warn(&self, message: &str) {
        log::warn!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }

    fn info_gap(&self) {
        // pretty_env_logger writes to stderr; keep the gap on the same stream
        eprintln!();
    }

    fn announce_command(&self, cmd: &Cmd) {
        log::info!("# {}", cmd.rendered());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::*;

    /// Messenger that records everything instead of printing it.
    #[derive(Default)]
    pub struct RecordingMessenger {
        pub infos: RefCell<Vec<String>>,
        pub warnings: RefCell<Vec<String>>,
        pub errors: RefCell<Vec<String>>,
        pub announced: RefCell<Vec<String>>,
    }

    impl Messenger for RecordingMessenger {
        fn info(&self, message: &str) {
            self.infos.borrow_mut().push(message.to_string());
        }

        fn warn(&self, message: &str) {
            self.warnings.borrow_mut().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }

        fn info_gap(&self) {
            self.infos.borrow_mut().push(String::new());
        }

        fn announce_command(&self, cmd: &Cmd) {
            self.announced.borrow_mut().push(cmd.rendered());
        }
    }
}
