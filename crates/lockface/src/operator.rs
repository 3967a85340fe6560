//! The human at the keyboard: status lines, questions and greetings.

use image::GrayImage;
use parking_lot::Mutex;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// User-facing surface for both controllers. Implementations are called
/// from controller threads and must be thread-safe.
pub trait Operator: Send + Sync {
    fn status(&self, message: &str);

    fn notify(&self, level: Level, title: &str, message: &str);

    /// Ask a yes/no question.
    fn confirm(&self, title: &str, question: &str) -> bool;

    fn progress(&self, user: &str, count: usize, target: usize, ceiling: usize);

    /// Greet a recognised user; `None` clears the greeting.
    fn greet(&self, name: Option<&str>);

    fn preview(&self, _frame: &GrayImage) {}
}

/// Operator on stdout/stdin.
#[derive(Default)]
pub struct TerminalOperator {
    last_status: Mutex<String>,
    greeted: Mutex<Option<String>>,
}

impl TerminalOperator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operator for TerminalOperator {
    fn status(&self, message: &str) {
        let mut last = self.last_status.lock();
        if *last != message {
            println!("{message}");
            *last = message.to_string();
        }
    }

    fn notify(&self, level: Level, title: &str, message: &str) {
        match level {
            Level::Info => println!("{title}: {message}"),
            Level::Warning => eprintln!("warning: {title}: {message}"),
            Level::Error => eprintln!("error: {title}: {message}"),
        }
    }

    fn confirm(&self, title: &str, question: &str) -> bool {
        print!("{title}: {question} [y/N] ");
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => parse_answer(&answer),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read answer");
                false
            }
        }
    }

    fn progress(&self, user: &str, count: usize, target: usize, ceiling: usize) {
        print!("\r{user}: {count}/{target} photos (max {ceiling})");
        let _ = std::io::stdout().flush();
        if count >= target {
            println!();
        }
    }

    fn greet(&self, name: Option<&str>) {
        let mut greeted = self.greeted.lock();
        if greeted.as_deref() == name {
            return;
        }
        if let Some(name) = name {
            println!("Hello, {name}!");
        }
        *greeted = name.map(str::to_string);
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("\n"));
        assert!(!parse_answer("no"));
        assert!(!parse_answer("yep"));
    }

    #[test]
    fn test_greet_tracks_current_name() {
        let op = TerminalOperator::new();
        op.greet(Some("alice"));
        assert_eq!(op.greeted.lock().as_deref(), Some("alice"));
        op.greet(None);
        assert_eq!(op.greeted.lock().as_deref(), None);
    }
}
