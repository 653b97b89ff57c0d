//! Input validation for configuration files and CLI arguments
//!
//! Everything here returns `Result<_, String>` with a message fit for the
//! user; [`crate::config::PolicyConfig::validate`] lifts them into
//! [`crate::core::error::Error::Validation`].

use ipnetwork::IpNetwork;
use std::net::IpAddr;

use crate::core::family::AddressFamily;

/// Strips a rule id down to what is safe inside an nftables comment.
///
/// ```
/// use hostwall::validators::sanitize_rule_id;
///
/// assert_eq!(sanitize_rule_id("trust-in eth0"), "trust-in eth0");
/// assert_eq!(sanitize_rule_id("a\"b;c\n"), "abc");
/// ```
pub fn sanitize_rule_id(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '/'))
        .take(64)
        .collect()
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port or inclusive port range spec (`"22"`, `"60001-60005"`).
///
/// # Errors
///
/// Returns `Err` for non-numeric input, port 0, or a reversed range.
pub fn validate_port_spec(spec: &str) -> Result<(u16, u16), String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .map_err(|_| format!("'{spec}' is not a port or port range"))
            .and_then(validate_port)
    };
    let (lo, hi) = match spec.split_once('-') {
        Some((lo, hi)) => (parse(lo)?, parse(hi)?),
        None => {
            let p = parse(spec)?;
            (p, p)
        }
    };
    if lo > hi {
        return Err(format!("Port range '{spec}' has start after end"));
    }
    Ok((lo, hi))
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// An empty name means "not configured" and is accepted.
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }
    if name.len() > 15 {
        return Err(format!("Interface name '{name}' too long (max 15 characters)"));
    }
    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("Interface name '{name}' contains invalid characters"));
    }
    Ok(name.to_string())
}

/// Table names are `<prefix>filter` and `<prefix>nat`.
///
/// # Errors
///
/// Returns `Err` if the prefix is too long or not an nft identifier.
pub fn validate_table_prefix(prefix: &str) -> Result<String, String> {
    if prefix.len() > 32 {
        return Err("Table prefix too long (max 32 characters)".to_string());
    }
    if let Some(first) = prefix.chars().next()
        && !first.is_ascii_alphabetic()
    {
        return Err("Table prefix must start with a letter".to_string());
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("Table prefix may only contain letters, digits and '_'".to_string());
    }
    Ok(prefix.to_string())
}

/// Validates an address element spec (`"10.0.0.1"`, `"10.0.0.0/8"`,
/// `"10.0.0.1-10.0.0.9"`) for a table family.
///
/// # Errors
///
/// Returns `Err` if the spec does not parse or belongs to the other family.
pub fn validate_address_spec(spec: &str, family: AddressFamily) -> Result<String, String> {
    let addrs: Vec<IpAddr> = if let Some((lo, hi)) = spec.split_once('-') {
        let parse = |s: &str| {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|_| format!("'{spec}' is not an address range"))
        };
        vec![parse(lo)?, parse(hi)?]
    } else {
        let net: IpNetwork = spec
            .trim()
            .parse()
            .map_err(|_| format!("'{spec}' is not an address or CIDR"))?;
        vec![net.ip()]
    };
    if addrs.iter().any(|a| AddressFamily::of(a) != family) {
        return Err(format!("'{spec}' is not an {family} address"));
    }
    Ok(spec.trim().to_string())
}

/// Informational note for well-known admin ports. Never blocks.
pub fn check_well_known_port(port: u16) -> Option<String> {
    let name = match port {
        22 => "SSH",
        53 => "DNS",
        80 => "HTTP",
        443 => "HTTPS",
        25 => "SMTP",
        3389 => "RDP",
        _ if port <= 1024 => return Some(format!("Privileged port {port}")),
        _ => return None,
    };
    Some(format!("Port {port}: {name}"))
}

/// Warns when a trusted source is a range that is never seen on a WAN link.
pub fn check_reserved_source(net: IpNetwork) -> Option<String> {
    match net.ip() {
        IpAddr::V4(v4) if v4.is_loopback() => {
            Some("Loopback range (127.x) is rejected on non-loopback interfaces".to_string())
        }
        IpAddr::V4(v4) if v4.is_link_local() => {
            Some("Link-local range (169.254.x.x) - local network only".to_string())
        }
        IpAddr::V6(v6) if v6.is_loopback() => {
            Some("IPv6 loopback (::1) is rejected on non-loopback interfaces".to_string())
        }
        IpAddr::V6(v6) if v6.segments()[0] & 0xffc0 == 0xfe80 => {
            Some("IPv6 link-local (fe80::/10) - local network only".to_string())
        }
        _ => None,
    }
}
