//! Control flags carried in the multiplex header.

use std::{fmt, ops::BitOr};

/// Set of independent control bits.
///
/// Only the four defined bits can be represented; reserved bits found on
/// the wire are dropped by [`Control::from_bits_truncate`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Control(u8);

impl Control {
    /// Open the connection id.
    pub const SYN: Self = Self(0x01);
    /// Payload attached.
    pub const DAT: Self = Self(0x02);
    /// Graceful close.
    pub const FIN: Self = Self(0x04);
    /// Abnormal reset.
    pub const RST: Self = Self(0x08);

    const ALL: u8 = 0x0f;

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self { Self(0) }

    /// Keep the defined bits of `bits`, ignoring reserved ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self { Self(bits & Self::ALL) }

    /// Raw wire representation.
    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    /// Returns `true` if any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

    /// Returns `true` when no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool { self.0 == 0 }
}

impl BitOr for Control {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Control, &str); 4] = [
            (Control::SYN, "SYN"),
            (Control::DAT, "DAT"),
            (Control::FIN, "FIN"),
            (Control::RST, "RST"),
        ];
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::Control;

    #[rstest]
    #[case(0x01, Control::SYN)]
    #[case(0x03, Control::SYN | Control::DAT)]
    #[case(0xf4, Control::FIN)]
    #[case(0x0f, Control::SYN | Control::DAT | Control::FIN | Control::RST)]
    fn reserved_bits_are_dropped(#[case] raw: u8, #[case] expected: Control) {
        assert_eq!(Control::from_bits_truncate(raw), expected);
    }

    #[test]
    fn flags_combine_independently() {
        let flags = Control::SYN | Control::FIN;
        assert!(flags.contains(Control::SYN));
        assert!(flags.contains(Control::FIN));
        assert!(!flags.contains(Control::DAT));
        assert!(flags.intersects(Control::DAT | Control::FIN));
        assert!(!flags.contains(Control::SYN | Control::DAT));
    }

    #[test]
    fn debug_lists_set_flags() {
        assert_eq!(format!("{:?}", Control::SYN | Control::DAT), "SYN|DAT");
        assert_eq!(format!("{}", Control::empty()), "(empty)");
    }
}
