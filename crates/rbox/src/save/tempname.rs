use std::process;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;

/// Generates collision-free temporary file names for staged mail
///
/// Names combine wall-clock seconds and microseconds, the process id, a
/// per-generator counter and the host name:
/// `temp.<sec>.P<pid>Q<count>M<usec>.<host>`.
#[derive(Debug)]
pub struct TempNameGenerator {
    counter: AtomicU32,
    pid: u32,
    host: String,
}

impl TempNameGenerator {
    pub fn new() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self::with_host(&host)
    }

    pub fn with_host(host: &str) -> Self {
        Self {
            counter: AtomicU32::new(0),
            pid: process::id(),
            // keep the name a single path component
            host: host.replace(['/', '\\'], "_"),
        }
    }

    pub fn next_name(&self) -> String {
        let now = Utc::now();
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "temp.{}.P{}Q{}M{}.{}",
            now.timestamp(),
            self.pid,
            count,
            now.timestamp_subsec_micros(),
            self.host
        )
    }
}

impl Default for TempNameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique_per_generator() {
        let names = TempNameGenerator::with_host("mx1");
        let a = names.next_name();
        let b = names.next_name();
        assert_ne!(a, b);
        assert!(a.starts_with("temp."));
        assert!(a.ends_with(".mx1"));
        assert!(a.contains(&format!("P{}Q0M", process::id())));
        assert!(b.contains(&format!("P{}Q1M", process::id())));
    }

    #[test]
    fn test_counters_are_not_shared() {
        let first = TempNameGenerator::with_host("mx1");
        let second = TempNameGenerator::with_host("mx1");
        first.next_name();
        assert!(second.next_name().contains("Q0M"));
    }

    #[test]
    fn test_host_is_sanitised() {
        let names = TempNameGenerator::with_host("a/b");
        assert!(names.next_name().ends_with(".a_b"));
    }
}
