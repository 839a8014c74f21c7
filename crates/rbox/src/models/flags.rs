//! System flags of a message

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Set of IMAP system flags, stored as a bit mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MailFlags: u8 {
        const ANSWERED = 0x01;
        const FLAGGED  = 0x02;
        const DELETED  = 0x04;
        const SEEN     = 0x08;
        const DRAFT    = 0x10;
        /// Session-only flag; never persisted
        const RECENT   = 0x20;
    }
}

impl MailFlags {
    const IMAP_NAMES: [(Self, &'static str); 6] = [
        (Self::ANSWERED, "\\Answered"),
        (Self::FLAGGED, "\\Flagged"),
        (Self::DELETED, "\\Deleted"),
        (Self::SEEN, "\\Seen"),
        (Self::DRAFT, "\\Draft"),
        (Self::RECENT, "\\Recent"),
    ];
}

impl Default for MailFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for MailFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::IMAP_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "({})", names.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_cleared() {
        let flags = MailFlags::SEEN | MailFlags::RECENT;
        let saved = flags.difference(MailFlags::RECENT);
        assert!(saved.contains(MailFlags::SEEN));
        assert!(!saved.contains(MailFlags::RECENT));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            (MailFlags::SEEN | MailFlags::FLAGGED).to_string(),
            "(\\Flagged \\Seen)"
        );
        assert_eq!(MailFlags::empty().to_string(), "()");
        assert_eq!(MailFlags::default(), MailFlags::empty());
    }

    #[test]
    fn test_from_bits_truncate_masks_unknown() {
        assert_eq!(MailFlags::from_bits_truncate(0xff).bits(), 0x3f);
        assert_eq!(MailFlags::from_bits(0x40), None);
    }
}
