use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(pub String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN: {}", self.0)
    }
}
impl std::error::Error for ParseLsnError {}

/// A WAL position, printed by PostgreSQL as `XXXXXXXX/XXXXXXXX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn parse(s: &str) -> Result<Lsn, ParseLsnError> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ParseLsnError(s.into()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.into()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The position immediately before this one; zero stays zero.
    #[inline]
    pub fn prev(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }

    pub fn to_pg_string(self) -> String {
        format!("{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pg_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Lsn;

    #[test]
    fn lsn_parse_roundtrip() {
        let s = "16/B374D848";
        let l = Lsn::parse(s).unwrap();
        assert_eq!(l.to_pg_string(), s);
    }

    #[test]
    fn lsn_parse_rejects_garbage() {
        assert!(Lsn::parse("16B374D848").is_err());
        assert!(Lsn::parse("xyz/1").is_err());
        assert!(Lsn::parse("1/123456789").is_err());
    }

    #[test]
    fn lsn_orders_by_position() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.prev(), a);
        assert_eq!(Lsn::ZERO.prev(), Lsn::ZERO);
    }
}
