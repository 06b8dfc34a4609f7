use crate::{ObjectInfo, TIME_SENTINEL};

/// Parsed cache directives of one object. All durations are seconds; zero
/// means the directive is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub expires: u64,
    pub max_age: u64,
    pub s_max_age: u64,
    pub min_fresh: u64,
    pub no_store: bool,
    pub no_cache: bool,
}

impl CacheControl {
    /// Collect directives from the object's `cache-control` user metadata
    /// and its `Expires` timestamp.
    pub fn from_object_info(info: &ObjectInfo) -> Self {
        let mut cc = CacheControl {
            expires: info.expires,
            ..Default::default()
        };
        let raw = match info.cache_control() {
            Some(v) => v,
            None => return cc,
        };
        for directive in raw.split(',') {
            let directive = directive.trim();
            if directive.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
                continue;
            }
            if directive.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
                continue;
            }
            let (name, value) = match directive.split_once('=') {
                Some((n, v)) => (n.trim(), v.trim()),
                None => continue,
            };
            let secs = match value.parse::<u64>() {
                Ok(s) => s,
                Err(_) => continue,
            };
            if name.eq_ignore_ascii_case("max-age") {
                cc.max_age = secs;
            } else if name.eq_ignore_ascii_case("s-maxage") {
                cc.s_max_age = secs;
            } else if name.eq_ignore_ascii_case("min-fresh") {
                cc.min_fresh = secs;
            }
        }
        cc
    }

    pub fn is_empty(&self) -> bool {
        *self == CacheControl::default()
    }

    /// A stale entry needs ETag revalidation before it may be served.
    /// `no-store`/`no-cache` force revalidation; `s-maxage` wins over
    /// `max-age`; `min-fresh` shrinks the usable freshness window; an
    /// `Expires` in the past always makes the entry stale.
    pub fn is_stale(&self, mod_time: u64, now: u64) -> bool {
        if self.no_store || self.no_cache {
            return true;
        }
        let age = now.saturating_sub(mod_time);
        let max_age = if self.s_max_age > 0 {
            self.s_max_age
        } else {
            self.max_age
        };
        if max_age > 0 && age + self.min_fresh >= max_age {
            return true;
        }
        if self.expires != TIME_SENTINEL && now >= self.expires {
            return true;
        }
        // nothing but an unset max-age and a future (or absent) Expires
        max_age == 0 && self.expires == TIME_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::METADATA_CACHE_CONTROL;

    fn info_with(cache_control: Option<&str>, expires: u64, mod_time: u64) -> ObjectInfo {
        let mut info = ObjectInfo {
            bucket: "b".to_string(),
            name: "o".to_string(),
            mod_time,
            expires,
            ..Default::default()
        };
        if let Some(cc) = cache_control {
            info.user_defined
                .insert(METADATA_CACHE_CONTROL.to_string(), cc.to_string());
        }
        info
    }

    #[test]
    fn test_parse_directives() {
        let info = info_with(Some("max-age=3600, s-maxage=600, min-fresh=10, no-cache"), 0, 0);
        let cc = CacheControl::from_object_info(&info);
        assert_eq!(cc.max_age, 3600);
        assert_eq!(cc.s_max_age, 600);
        assert_eq!(cc.min_fresh, 10);
        assert!(cc.no_cache);
        assert!(!cc.no_store);
    }

    #[test]
    fn test_empty_when_no_directives() {
        let cc = CacheControl::from_object_info(&info_with(None, 0, 0));
        assert!(cc.is_empty());

        let cc = CacheControl::from_object_info(&info_with(Some("garbage, max-age=x"), 0, 0));
        assert!(cc.is_empty());
    }

    #[test]
    fn test_max_age_freshness() {
        let now = 10_000u64;
        let cc = CacheControl::from_object_info(&info_with(Some("max-age=3600"), 0, 0));
        assert!(!cc.is_stale(now - 100, now));
        assert!(cc.is_stale(now - 3600, now));

        let cc = CacheControl::from_object_info(&info_with(Some("max-age=0"), 0, 0));
        assert!(cc.is_stale(now, now));
    }

    #[test]
    fn test_s_maxage_takes_precedence() {
        let now = 10_000u64;
        let cc = CacheControl::from_object_info(&info_with(Some("max-age=3600, s-maxage=60"), 0, 0));
        assert!(cc.is_stale(now - 120, now));
        assert!(!cc.is_stale(now - 30, now));
    }

    #[test]
    fn test_expires_freshness() {
        let now = 10_000u64;
        let cc = CacheControl::from_object_info(&info_with(None, now + 100, now - 10));
        assert!(!cc.is_stale(now - 10, now));

        let cc = CacheControl::from_object_info(&info_with(None, now - 1, now - 10));
        assert!(cc.is_stale(now - 10, now));
    }

    #[test]
    fn test_no_store_always_stale() {
        let now = 10_000u64;
        let cc = CacheControl::from_object_info(&info_with(Some("no-store, max-age=3600"), 0, now));
        assert!(cc.is_stale(now, now));
    }
}
