//! Input validation for zonewall
//!
//! Everything here runs before a value reaches the kernel or the
//! filesystem. Errors are plain strings meant for the operator.

use crate::core::expr::TimeUnit;
use ipnetwork::IpNetwork;

/// Validates an interface name for a zone membership.
///
/// # Examples
///
/// ```
/// use zonewall::validators::validate_interface;
///
/// assert!(validate_interface("eth0").is_ok());
/// assert!(validate_interface("br0.100").is_ok());
/// assert!(validate_interface("eth0; rm -rf /").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 15 characters (the kernel
/// field is 16 bytes with a trailing NUL), `.`/`..`, or contains anything
/// other than ASCII alphanumerics, dot, dash and underscore.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a region, namespace or prefix-list name.
///
/// These become file names under the state directory and under the
/// namespace directory, so the rules are strict: ASCII alphanumerics, `_`
/// and `-`, at most 64 characters.
///
/// # Errors
///
/// Returns `Err` describing the first violated rule.
pub fn validate_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if name.len() > 64 {
        return Err("Name too long (max 64 chars)".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -)".to_string());
    }

    Ok(name.to_string())
}

/// Parses and normalizes a CIDR for an allow-list.
///
/// Host bits are cleared, so `10.1.2.3/24` becomes `10.1.2.0/24`.
///
/// # Errors
///
/// Returns `Err` if the value does not parse as an IPv4 or IPv6 network.
pub fn validate_cidr(value: &str) -> Result<String, String> {
    crate::core::templates::parse_cidr(value)
        .map(|net| net.to_string())
        .map_err(|e| e.to_string())
}

/// Flags allow-list entries that are legal but almost certainly a mistake.
pub fn check_prefix_scope(net: IpNetwork) -> Option<String> {
    if net.prefix() == 0 {
        return Some(format!("{net} allows every source address"));
    }
    match net {
        IpNetwork::V4(v4) if v4.ip().is_loopback() => {
            Some(format!("{net} is loopback and never crosses zones"))
        }
        IpNetwork::V6(v6) if v6.ip().is_loopback() => {
            Some(format!("{net} is loopback and never crosses zones"))
        }
        IpNetwork::V4(v4) if v4.ip().is_multicast() => {
            Some(format!("{net} is multicast, not a source range"))
        }
        IpNetwork::V6(v6) if v6.ip().is_multicast() => {
            Some(format!("{net} is multicast, not a source range"))
        }
        _ => None,
    }
}

/// Validates a packet rate limit.
///
/// Returns `Ok(Some(warning))` for high but acceptable values.
///
/// # Errors
///
/// Returns `Err` for a zero rate, a rate above the per-unit maximum, or a
/// burst above 65535.
pub fn validate_rate_limit(rate: u64, unit: TimeUnit, burst: u32) -> Result<Option<String>, String> {
    if rate == 0 {
        return Err("Rate must be positive".to_string());
    }

    if burst > 65_535 {
        return Err("Burst exceeds max (65535)".to_string());
    }

    let (max, warn) = match unit {
        TimeUnit::Second => (10_000, 1_000),
        TimeUnit::Minute => (100_000, 10_000),
        TimeUnit::Hour => (1_000_000, 100_000),
        TimeUnit::Day => (10_000_000, 1_000_000),
    };

    if rate > max {
        return Err(format!("Rate limit exceeds max {max}/{unit}"));
    }

    if rate > warn {
        return Ok(Some(format!(
            "High rate ({rate}/{unit}) - typical: 10-{}",
            warn / 10
        )));
    }

    Ok(None)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_valid_interfaces_fit_kernel_field(name in "[a-zA-Z0-9._-]{1,15}") {
            prop_assume!(name != "." && name != "..");
            let validated = validate_interface(&name).unwrap();
            prop_assert!(crate::core::templates::pad_ifname(&validated).is_ok());
        }

        #[test]
        fn test_interface_rejects_long_names(name in "[a-z]{16,40}") {
            prop_assert!(validate_interface(&name).is_err());
        }

        #[test]
        fn test_names_never_contain_separators(name in "\\PC*") {
            if let Ok(valid) = validate_name(&name) {
                prop_assert!(!valid.contains('/'));
                prop_assert!(!valid.contains('.'));
            }
        }

        #[test]
        fn test_cidr_normalization_is_stable(a in any::<u32>(), len in 0u8..=32) {
            let input = format!("{}/{}", std::net::Ipv4Addr::from(a), len);
            let once = validate_cidr(&input).unwrap();
            prop_assert_eq!(validate_cidr(&once).unwrap(), once);
        }
    }
}
