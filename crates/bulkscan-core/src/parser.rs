//! Target string parser: `[rank,][//]["]host["][:port]`.

use crate::denylist::Denylist;
use crate::model::ScanTarget;
use crate::resolver::HostResolver;
use crate::status::JobStatus;
use std::net::IpAddr;

/// Outcome of parsing + resolving + denylisting one target string.
pub struct ParsedTarget {
    pub target: ScanTarget,
    pub status: JobStatus,
    /// Set only when `status == RESOLUTION_ERROR`: the captured exception text, for the
    /// `ScanResult` the publisher persists alongside this status.
    pub exception: Option<String>,
}

/// Applies the target grammar left-to-right, then resolves and denylists the result.
pub struct TargetParser<R: HostResolver> {
    resolver: R,
}

impl<R: HostResolver> TargetParser<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub async fn parse(&self, raw: &str, default_port: u16, denylist: &Denylist) -> ParsedTarget {
        let syntax = match parse_syntax(raw, default_port) {
            Ok(s) => s,
            Err(e) => {
                return ParsedTarget {
                    target: ScanTarget::with_port(default_port),
                    status: JobStatus::ResolutionError,
                    exception: Some(e),
                }
            }
        };

        let mut target = ScanTarget::with_port(syntax.port);
        target.set_rank(syntax.rank);

        if let Ok(ip) = syntax.literal.parse::<IpAddr>() {
            target.set_ip(ip);
        } else {
            target.set_hostname(syntax.literal.clone());
            match self.resolver.resolve(&syntax.literal).await {
                Ok(ip) => {
                    target.set_ip(ip);
                }
                Err(_) => {
                    return ParsedTarget {
                        target,
                        status: JobStatus::Unresolvable,
                        exception: None,
                    }
                }
            }
        }

        let status = if denylist.matches(target.hostname.as_deref(), target.ip) {
            JobStatus::Denylisted
        } else {
            JobStatus::ToBeExecuted
        };

        ParsedTarget {
            target,
            status,
            exception: None,
        }
    }
}

struct Syntax {
    rank: u64,
    literal: String,
    port: u16,
}

/// Pure, synchronous half of the grammar: rank/mx-hint/quote stripping and port adoption.
/// Returns `Err` only for malformed syntax — an empty literal after stripping, treated as
/// "any other parsing exception".
fn parse_syntax(raw: &str, default_port: u16) -> Result<Syntax, String> {
    let mut s = raw.trim();

    // 1. Leading integer followed by a comma -> rank; strip.
    let mut rank = 0u64;
    if let Some(comma) = s.find(',') {
        let (head, tail) = s.split_at(comma);
        if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
            rank = head.parse().unwrap_or(0);
            s = &tail[1..];
        }
    }

    // 2. Leading "//" -> strip (mail-exchange hint).
    if let Some(stripped) = s.strip_prefix("//") {
        s = stripped;
    }

    // 3. Surrounding double-quotes -> strip. The quotes wrap the host only; a port suffix may
    //    trail the closing quote (e.g. `"mail.example.com":25`), so track it separately.
    let mut trailing_after_quote: Option<&str> = None;
    if let Some(rest) = s.strip_prefix('"') {
        if let Some(close) = rest.find('"') {
            trailing_after_quote = Some(&rest[close + 1..]);
            s = &rest[..close];
        }
    }

    // 4. Trailing ":port" — only recognized as a port suffix when there's exactly one colon,
    //    or a bracketed IPv6 literal `[addr]:port`. Bare IPv6 literals keep every colon.
    let (literal, port) = if let Some(suffix) = trailing_after_quote {
        let port = suffix
            .strip_prefix(':')
            .and_then(|p| p.parse::<i64>().ok())
            .filter(|&p| p > 1 && p < 65535)
            .map(|p| p as u16)
            .unwrap_or(default_port);
        (s.to_string(), port)
    } else if let Some(rest) = s.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => {
                let addr = &rest[..end];
                let after = &rest[end + 1..];
                let port = after
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<i64>().ok())
                    .filter(|&p| p > 1 && p < 65535)
                    .map(|p| p as u16)
                    .unwrap_or(default_port);
                (addr.to_string(), port)
            }
            None => (s.to_string(), default_port),
        }
    } else {
        match s.matches(':').count() {
            1 => {
                let idx = s.find(':').unwrap();
                let (host, port_str) = (&s[..idx], &s[idx + 1..]);
                let port = port_str
                    .parse::<i64>()
                    .ok()
                    .filter(|&p| p > 1 && p < 65535)
                    .map(|p| p as u16)
                    .unwrap_or(default_port);
                (host.to_string(), port)
            }
            _ => (s.to_string(), default_port),
        }
    };

    if literal.is_empty() {
        return Err(format!("empty target literal after parsing {raw:?}"));
    }

    Ok(Syntax { rank, literal, port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;

    fn parser() -> TargetParser<StaticResolver> {
        TargetParser::new(
            StaticResolver::new()
                .with("mail.example.com", "203.0.113.5".parse().unwrap())
                .with("blocked.example.com", "198.51.100.9".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn single_ip_target_with_explicit_port() {
        let p = parser();
        let out = p.parse("192.0.2.1:4433", 443, &Denylist::empty()).await;
        assert_eq!(out.status, JobStatus::ToBeExecuted);
        assert_eq!(out.target.ip, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(out.target.hostname, None);
        assert_eq!(out.target.port, 4433);
        assert_eq!(out.target.tranco_rank, 0);
    }

    #[tokio::test]
    async fn ranked_mx_style_entry() {
        let p = parser();
        let out = p
            .parse("100,//\"mail.example.com\":25", 443, &Denylist::empty())
            .await;
        assert_eq!(out.status, JobStatus::ToBeExecuted);
        assert_eq!(out.target.hostname.as_deref(), Some("mail.example.com"));
        assert_eq!(out.target.ip, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(out.target.port, 25);
        assert_eq!(out.target.tranco_rank, 100);
    }

    #[tokio::test]
    async fn unresolvable_host_yields_unresolvable_status() {
        let p = parser();
        let out = p.parse("nx.invalid", 443, &Denylist::empty()).await;
        assert_eq!(out.status, JobStatus::Unresolvable);
        assert_eq!(out.target.ip, None);
    }

    #[tokio::test]
    async fn denylisted_hostname() {
        let p = parser();
        let denylist = Denylist::parse("blocked.example.com\n");
        let out = p.parse("blocked.example.com", 443, &denylist).await;
        assert_eq!(out.status, JobStatus::Denylisted);
    }

    #[tokio::test]
    async fn port_boundaries_fall_back_to_default_unless_strictly_between_1_and_65535() {
        let p = parser();
        let denylist = Denylist::empty();
        for (input, expected_port) in [
            ("192.0.2.1:0", 443),
            ("192.0.2.1:1", 443),
            ("192.0.2.1:2", 2),
            ("192.0.2.1:65534", 65534),
            ("192.0.2.1:65535", 443),
            ("192.0.2.1:notanumber", 443),
        ] {
            let out = p.parse(input, 443, &denylist).await;
            assert_eq!(out.target.port, expected_port, "input={input}");
        }
    }

    #[tokio::test]
    async fn empty_literal_is_a_resolution_error() {
        let p = parser();
        let out = p.parse("\"\"", 443, &Denylist::empty()).await;
        assert_eq!(out.status, JobStatus::ResolutionError);
        assert!(out.exception.is_some());
    }
}
