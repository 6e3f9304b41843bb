use std::time::{Duration, SystemTime};

use crate::proxy::headers::HeaderList;

/// Header-driven admission rules for the response cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// When false, `Cache-Control: no-store` marks a response cacheable, as
    /// `public` does.
    pub honor_no_store: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheDecision {
    pub cacheable: bool,
    pub expires_at: Option<SystemTime>,
}

impl CacheDecision {
    fn uncacheable() -> Self {
        Self {
            cacheable: false,
            expires_at: None,
        }
    }

    fn cacheable(expires_at: Option<SystemTime>) -> Self {
        Self {
            cacheable: true,
            expires_at,
        }
    }
}

impl CachePolicy {
    /// Walks the headers in arrival order. `public` and `no-store` accept
    /// before `max-age` is judged, so `public, max-age=0` is cacheable.
    /// Every expiry candidate (`max-age`, `Expires`) is kept only if it is
    /// later than the current one.
    pub fn evaluate(&self, headers: &HeaderList, now: SystemTime) -> CacheDecision {
        let mut expires_at: Option<SystemTime> = None;

        for line in headers.iter() {
            match line.lower_name() {
                "cache-control" => {
                    let value = line.value.to_ascii_lowercase();
                    if value.contains("private") || value.contains("no-cache") {
                        return CacheDecision::uncacheable();
                    }
                    let max_age = parse_max_age(&value);
                    let no_store = value.contains("no-store");
                    if no_store && self.honor_no_store {
                        return CacheDecision::uncacheable();
                    }
                    if value.contains("public") || no_store {
                        // Accepted outright; a zero max-age adds no expiry.
                        if let Some(seconds) = max_age.filter(|seconds| *seconds > 0) {
                            expires_at = later_by(expires_at, now, seconds);
                        }
                        return CacheDecision::cacheable(expires_at);
                    }
                    if let Some(seconds) = max_age {
                        if seconds == 0 {
                            return CacheDecision::uncacheable();
                        }
                        expires_at = later_by(expires_at, now, seconds);
                    }
                }
                "pragma" => {
                    if line.value.trim().eq_ignore_ascii_case("no-cache") {
                        return CacheDecision::uncacheable();
                    }
                }
                "expires" => {
                    if let Ok(candidate) = httpdate::parse_http_date(line.value.trim()) {
                        expires_at = later(expires_at, candidate);
                    }
                }
                _ => {}
            }
        }

        CacheDecision::cacheable(expires_at)
    }
}

fn parse_max_age(value: &str) -> Option<u64> {
    value.split(',').find_map(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .and_then(|seconds| seconds.trim_matches('"').parse::<u64>().ok())
    })
}

fn later_by(current: Option<SystemTime>, now: SystemTime, seconds: u64) -> Option<SystemTime> {
    match now.checked_add(Duration::from_secs(seconds)) {
        Some(candidate) => later(current, candidate),
        None => current,
    }
}

fn later(current: Option<SystemTime>, candidate: SystemTime) -> Option<SystemTime> {
    match current {
        Some(existing) if existing >= candidate => Some(existing),
        _ => Some(candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluate(headers: &[(&str, &str)]) -> CacheDecision {
        evaluate_with(CachePolicy::default(), headers, SystemTime::now())
    }

    fn evaluate_with(
        policy: CachePolicy,
        headers: &[(&str, &str)],
        now: SystemTime,
    ) -> CacheDecision {
        let list: HeaderList = headers.iter().copied().collect();
        policy.evaluate(&list, now)
    }

    #[test]
    fn private_and_no_cache_are_rejected() {
        assert!(!evaluate(&[("Cache-Control", "private")]).cacheable);
        assert!(!evaluate(&[("cache-control", "No-Cache")]).cacheable);
        assert!(!evaluate(&[("Cache-Control", "public, private")]).cacheable);
    }

    #[test]
    fn no_store_is_cacheable_unless_honored() {
        assert!(evaluate(&[("Cache-Control", "no-store")]).cacheable);

        let strict = CachePolicy {
            honor_no_store: true,
        };
        let decision = evaluate_with(strict, &[("Cache-Control", "no-store")], SystemTime::now());
        assert!(!decision.cacheable);
    }

    #[test]
    fn max_age_zero_is_rejected() {
        assert!(!evaluate(&[("Cache-Control", "max-age=0")]).cacheable);
    }

    #[test]
    fn max_age_sets_expiry() {
        let now = SystemTime::now();
        let decision = evaluate_with(
            CachePolicy::default(),
            &[("Cache-Control", "max-age=60")],
            now,
        );
        assert!(decision.cacheable);
        assert_eq!(decision.expires_at, Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn public_keeps_max_age_from_same_value() {
        let now = SystemTime::now();
        let decision = evaluate_with(
            CachePolicy::default(),
            &[("Cache-Control", "public, max-age=30"), ("Pragma", "no-cache")],
            now,
        );
        assert!(decision.cacheable);
        assert_eq!(decision.expires_at, Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn public_or_no_store_wins_over_zero_max_age() {
        let decision = evaluate(&[("Cache-Control", "public, max-age=0")]);
        assert!(decision.cacheable);
        assert_eq!(decision.expires_at, None);

        let decision = evaluate(&[("Cache-Control", "no-store, max-age=0")]);
        assert!(decision.cacheable);

        let strict = CachePolicy {
            honor_no_store: true,
        };
        let decision = evaluate_with(
            strict,
            &[("Cache-Control", "no-store, max-age=0")],
            SystemTime::now(),
        );
        assert!(!decision.cacheable);
    }

    #[test]
    fn pragma_no_cache_is_rejected() {
        assert!(!evaluate(&[("Pragma", "no-cache")]).cacheable);
        assert!(evaluate(&[("Pragma", "other")]).cacheable);
    }

    #[test]
    fn no_relevant_headers_is_cacheable_without_expiry() {
        let decision = evaluate(&[("Content-Type", "text/plain")]);
        assert!(decision.cacheable);
        assert_eq!(decision.expires_at, None);
    }

    #[test]
    fn later_candidate_wins_regardless_of_order() {
        let now = SystemTime::now();
        let past = httpdate::fmt_http_date(now - Duration::from_secs(3600));
        let decision = evaluate_with(
            CachePolicy::default(),
            &[("Expires", past.as_str()), ("Cache-Control", "max-age=3600")],
            now,
        );
        assert_eq!(decision.expires_at, Some(now + Duration::from_secs(3600)));

        let future = now + Duration::from_secs(7200);
        let future_str = httpdate::fmt_http_date(future);
        let decision = evaluate_with(
            CachePolicy::default(),
            &[("Cache-Control", "max-age=60"), ("Expires", future_str.as_str())],
            now,
        );
        let expires_at = decision.expires_at.unwrap();
        // HTTP dates carry whole seconds.
        assert!(expires_at > now + Duration::from_secs(7198));
    }

    #[test]
    fn unparseable_expires_is_ignored() {
        let decision = evaluate(&[("Expires", "tomorrow-ish")]);
        assert!(decision.cacheable);
        assert_eq!(decision.expires_at, None);
    }
}
