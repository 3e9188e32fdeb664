// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-limited hex dumps for error messages and trace logs.

use pretty_hex::PrettyHex;

/// Formats at most `max_bytes` of `inner` via `pretty-hex`, noting how much
/// was left out.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }

    fn shown(&self) -> (&'a [u8], Option<usize>) {
        match self.inner.len().checked_sub(self.max_bytes) {
            Some(omitted) if omitted > 0 => (&self.inner[..self.max_bytes], Some(omitted)),
            _ => (self.inner, None),
        }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (print, omitted) = self.shown();
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        writeln!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(o) = omitted {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", o)?;
        }
        Ok(())
    }
}

/// Single-line form, for `trace!` output.
impl<'a> std::fmt::Display for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (print, omitted) = self.shown();
        for (i, b) in print.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        if let Some(o) = omitted {
            write!(f, " (+{} bytes)", o)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn truncates() {
        let data = [0xabu8; 10];
        let s = format!("{}", LimitedHex::new(&data, 4));
        assert_eq!(s, "ab ab ab ab (+6 bytes)");
        let s = format!("{:?}", LimitedHex::new(&data, 4));
        assert!(s.starts_with("Length: 10 (0xa) bytes\n"), "{}", s);
        assert!(s.ends_with("...6 (0x6) bytes not shown..."), "{}", s);
    }

    #[test]
    fn short_input_untouched() {
        let data = [1u8, 2];
        assert_eq!(format!("{}", LimitedHex::new(&data, 4)), "01 02");
    }
}
