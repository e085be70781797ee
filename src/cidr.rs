//! IP/CIDR utilities (C1): precomputed prefix masks for matching an observed
//! client address against a mechanism's network under a prefix length.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const V4_MASKS: [u32; 33] = build_v4_masks();
const V6_MASKS: [u128; 129] = build_v6_masks();

const fn build_v4_masks() -> [u32; 33] {
    let mut masks = [0u32; 33];
    let mut prefix = 0;
    while prefix <= 32 {
        masks[prefix as usize] = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        prefix += 1;
    }
    masks
}

const fn build_v6_masks() -> [u128; 129] {
    let mut masks = [0u128; 129];
    let mut prefix = 0;
    while prefix <= 128 {
        masks[prefix as usize] = if prefix == 0 {
            0
        } else {
            u128::MAX << (128 - prefix)
        };
        prefix += 1;
    }
    masks
}

/// A `dual-cidr-length`: independent prefix lengths for the v4 and v6 forms
/// of a mechanism's network, as produced by the `ip4`/`ip6`/`a`/`mx`
/// mechanism syntax (`a/24`, `a//64`, `a/24/64`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidrLength {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidrLength {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

impl DualCidrLength {
    pub fn v4_only(plen: u8) -> Self {
        Self {
            v4: plen,
            ..Self::default()
        }
    }

    pub fn v6_only(plen: u8) -> Self {
        Self {
            v6: plen,
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.v4 <= 32 && self.v6 <= 128
    }

    /// Whether `observed` (the SMTP client's address) falls within the
    /// network described by `network`, under this mechanism's prefix
    /// lengths. IPv4/IPv6 family mismatches never match.
    pub fn matches(&self, observed: IpAddr, network: IpAddr) -> bool {
        match (observed, network) {
            (IpAddr::V4(observed), IpAddr::V4(network)) => {
                mask_v4(observed, self.v4) == mask_v4(network, self.v4)
            }
            (IpAddr::V6(observed), IpAddr::V6(network)) => {
                mask_v6(observed, self.v6) == mask_v6(network, self.v6)
            }
            _ => false,
        }
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> u32 {
    u32::from(addr) & V4_MASKS[prefix as usize]
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> u128 {
    u128::from(addr) & V6_MASKS[prefix as usize]
}

/// Parse a trailing `/v4len` or `/v4len/v6len` (double-slash form reserved
/// for a v6-only length, e.g. `//64`) off the end of `s`, returning the
/// remainder and the resulting lengths. Absent lengths default to 32/128.
pub fn parse_dual_cidr_suffix(s: &str) -> Result<(&str, DualCidrLength), &'static str> {
    // Double slash means "no v4 length, only a v6 length": `a//64`
    if let Some(idx) = s.rfind("//") {
        let (prefix, v6_str) = (&s[..idx], &s[idx + 2..]);
        let v6: u8 = v6_str.parse().map_err(|_| "invalid v6 prefix length")?;
        let cidr = DualCidrLength::v6_only(v6);
        if !cidr.is_valid() {
            return Err("v6 prefix length out of range");
        }
        return Ok((prefix, cidr));
    }

    match s.rfind('/') {
        None => Ok((s, DualCidrLength::default())),
        Some(idx) => {
            let (prefix, v4_str) = (&s[..idx], &s[idx + 1..]);
            // `a/24/64` — a v4 length followed by a v6 length.
            if let Some(idx2) = prefix.rfind('/') {
                let (prefix2, maybe_v4) = (&prefix[..idx2], &prefix[idx2 + 1..]);
                if let Ok(v4) = maybe_v4.parse::<u8>() {
                    let v6: u8 = v4_str.parse().map_err(|_| "invalid v6 prefix length")?;
                    let cidr = DualCidrLength { v4, v6 };
                    if !cidr.is_valid() {
                        return Err("prefix length out of range");
                    }
                    return Ok((prefix2, cidr));
                }
            }
            let v4: u8 = v4_str.parse().map_err(|_| "invalid v4 prefix length")?;
            let cidr = DualCidrLength::v4_only(v4);
            if !cidr.is_valid() {
                return Err("v4 prefix length out of range");
            }
            Ok((prefix, cidr))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v4_match() {
        let cidr = DualCidrLength::v4_only(24);
        let net: IpAddr = "192.0.2.0".parse().unwrap();
        assert!(cidr.matches("192.0.2.17".parse().unwrap(), net));
        assert!(!cidr.matches("192.0.3.17".parse().unwrap(), net));
    }

    #[test]
    fn v6_match() {
        let cidr = DualCidrLength::v6_only(64);
        let net: IpAddr = "2001:db8::".parse().unwrap();
        assert!(cidr.matches("2001:db8::cb01".parse().unwrap(), net));
        assert!(!cidr.matches("2001:db9::cb01".parse().unwrap(), net));
    }

    #[test]
    fn family_mismatch_never_matches() {
        let cidr = DualCidrLength::default();
        let net: IpAddr = "192.0.2.0".parse().unwrap();
        assert!(!cidr.matches("::1".parse().unwrap(), net));
    }

    #[test]
    fn parse_suffix_forms() {
        assert_eq!(
            parse_dual_cidr_suffix("example.com/24").unwrap(),
            ("example.com", DualCidrLength::v4_only(24))
        );
        assert_eq!(
            parse_dual_cidr_suffix("example.com//64").unwrap(),
            ("example.com", DualCidrLength::v6_only(64))
        );
        assert_eq!(
            parse_dual_cidr_suffix("example.com/24/64").unwrap(),
            ("example.com", DualCidrLength { v4: 24, v6: 64 })
        );
        assert_eq!(
            parse_dual_cidr_suffix("example.com").unwrap(),
            ("example.com", DualCidrLength::default())
        );
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(parse_dual_cidr_suffix("example.com/33").is_err());
        assert!(parse_dual_cidr_suffix("example.com//129").is_err());
    }
}
