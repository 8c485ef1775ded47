//! The freshness engine.
//!
//! Decides when a cached object may be served as-is and when it must be
//! revalidated against the origin. The rules deliberately trade strict
//! RFC 7234 conformance for behavior that works with real-world servers:
//! server directives are capped, and objects without any validator get a
//! short heuristic lifetime.

use crate::config::Config;
use crate::object::{CacheFlags, CacheControl, Object};

/// The instant the object becomes stale, as epoch seconds.
///
/// Computed as the minimum of every applicable upper bound:
///
/// - `age + max_age` when the server sent max-age;
/// - `age + s_maxage` in a shared cache when the server sent s-maxage;
/// - a global cap: `age + max_expires_age` when any server freshness
///   directive is present, else `age + max_age` from the configuration;
/// - `age + (expires - date)` when only Expires is given;
/// - the heuristic `age + max_age_fraction * (date - last_modified)` when
///   only a Last-Modified validator exists;
/// - `age + max_no_modified_age` when the response has no validator at all.
pub fn stale_at(obj: &Object, config: &Config) -> i64 {
    let age = if obj.age() >= 0 { obj.age() } else { obj.date().max(0) };
    let date = if obj.date() >= 0 { obj.date() } else { age };

    let mut stale = i64::MAX;
    let mut server_directive = false;

    if obj.max_age() >= 0 {
        stale = stale.min(age + obj.max_age());
        server_directive = true;
    }
    if config.cache_is_shared && obj.s_maxage() >= 0 {
        stale = stale.min(age + obj.s_maxage());
        server_directive = true;
    }
    if obj.expires() >= 0 {
        server_directive = true;
    }

    let explicit_age =
        obj.max_age() >= 0 || (config.cache_is_shared && obj.s_maxage() >= 0);
    if !explicit_age {
        if obj.expires() >= 0 {
            stale = stale.min(age + (obj.expires() - date).max(0));
        } else if obj.last_modified() >= 0 {
            let heuristic =
                ((date - obj.last_modified()).max(0) as f64 * config.max_age_fraction) as i64;
            stale = stale.min(age + heuristic);
        } else {
            stale = stale.min(age + config.max_no_modified_age);
        }
    }

    let cap = if server_directive { config.max_expires_age } else { config.max_age };
    stale.min(age + cap)
}

/// True when the object is stale at `now` for a request carrying `cc`.
///
/// `min-fresh` and `max-stale` shift the boundary, but only when the object
/// is not subject to mandatory revalidation.
pub fn is_stale(obj: &Object, cc: &CacheControl, config: &Config, now: i64) -> bool {
    let mut boundary = stale_at(obj, config);
    let mandatory = obj.cache_flags().contains(CacheFlags::MUST_REVALIDATE)
        || (config.cache_is_shared
            && obj.cache_flags().contains(CacheFlags::PROXY_REVALIDATE));
    // An explicit zero lifetime means revalidate on every request, even
    // within the second it was received.
    let explicit_zero =
        obj.max_age() == 0 || (config.cache_is_shared && obj.s_maxage() == 0);
    if explicit_zero && (mandatory || cc.max_stale < 0) {
        return true;
    }
    if !mandatory {
        if cc.min_fresh >= 0 {
            boundary = boundary.saturating_sub(cc.min_fresh);
        }
        if cc.max_stale >= 0 {
            boundary = boundary.saturating_add(cc.max_stale);
        }
    }
    now > boundary
}

/// True when the object must be revalidated on every access regardless of
/// its computed freshness.
pub fn must_revalidate(obj: &Object, config: &Config) -> bool {
    let flags = obj.cache_flags();
    if flags.intersects(CacheFlags::NO_CACHE | CacheFlags::NO_STORE) {
        return true;
    }
    if config.cache_is_shared && flags.contains(CacheFlags::PRIVATE) {
        return true;
    }
    if flags.contains(CacheFlags::VARY) && !config.mindlessly_cache_vary {
        return true;
    }
    if flags.contains(CacheFlags::COOKIE) && config.dont_cache_cookies {
        return true;
    }
    false
}

/// True when the object's freshness came from the Last-Modified heuristic
/// rather than an explicit server directive; such responses carry
/// Warning 113 when served beyond a day of age.
pub fn heuristic_freshness(obj: &Object, config: &Config) -> bool {
    obj.max_age() < 0
        && !(config.cache_is_shared && obj.s_maxage() >= 0)
        && obj.expires() < 0
        && obj.last_modified() >= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::chunk::{ChunkPool, CHUNK_SIZE};
    use crate::object::{ObjectKind, ObjectStore};
    use std::rc::Rc;

    fn make_object() -> (ObjectStore, Rc<Object>) {
        let pool = Rc::new(ChunkPool::new(16 * CHUNK_SIZE, 8 * CHUNK_SIZE, 12 * CHUNK_SIZE));
        let store = ObjectStore::new(&Config::default(), pool);
        let obj = store
            .make(ObjectKind::Http, &Atom::intern(b"http://o.test/fresh"), true)
            .unwrap();
        (store, obj)
    }

    #[test]
    fn max_age_bounds_freshness() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_max_age(60);
        assert_eq!(stale_at(&obj, &config), received + 60);

        let cc = CacheControl::default();
        assert!(!is_stale(&obj, &cc, &config, received + 59));
        assert!(is_stale(&obj, &cc, &config, received + 61));
    }

    #[test]
    fn max_age_zero_is_immediately_stale() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_max_age(0);
        let cc = CacheControl::default();
        assert!(is_stale(&obj, &cc, &config, received + 1));
    }

    #[test]
    fn s_maxage_wins_in_shared_cache() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_max_age(600);
        obj.set_s_maxage(30);
        assert_eq!(stale_at(&obj, &config), received + 30);

        let private = Config { cache_is_shared: false, ..Config::default() };
        assert_eq!(stale_at(&obj, &private), received + 600);
    }

    #[test]
    fn expires_minus_date_applies_without_max_age() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_expires(received + 300);
        assert_eq!(stale_at(&obj, &config), received + 300);
    }

    #[test]
    fn heuristic_fraction_of_last_modified() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_last_modified(received - 1000);
        // 0.1 of 1000 seconds.
        assert_eq!(stale_at(&obj, &config), received + 100);
        assert!(heuristic_freshness(&obj, &config));
    }

    #[test]
    fn no_validator_gets_the_short_fallback() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        assert_eq!(stale_at(&obj, &config), received + config.max_no_modified_age);
    }

    #[test]
    fn staleness_is_monotone_in_now() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_max_age(60);
        let cc = CacheControl::default();
        let mut was_stale = false;
        for now in (received..received + 200).step_by(7) {
            let stale = is_stale(&obj, &cc, &config, now);
            assert!(!was_stale || stale, "staleness went backwards at {now}");
            was_stale = stale;
        }
        assert!(was_stale);
    }

    #[test]
    fn max_stale_extends_and_min_fresh_shrinks() {
        let (_store, obj) = make_object();
        let config = Config::default();
        let received = 1_000_000;
        obj.set_age(received);
        obj.set_date(received);
        obj.set_max_age(60);

        let relaxed = CacheControl { max_stale: 100, ..CacheControl::default() };
        assert!(!is_stale(&obj, &relaxed, &config, received + 120));

        let strict = CacheControl { min_fresh: 30, ..CacheControl::default() };
        assert!(is_stale(&obj, &strict, &config, received + 40));

        // must-revalidate disables both adjustments.
        obj.add_cache_flags(CacheFlags::MUST_REVALIDATE);
        assert!(is_stale(&obj, &relaxed, &config, received + 120));
    }

    #[test]
    fn revalidation_triggers() {
        let (_store, obj) = make_object();
        let mut config = Config::default();
        assert!(!must_revalidate(&obj, &config));

        obj.add_cache_flags(CacheFlags::NO_CACHE);
        assert!(must_revalidate(&obj, &config));
        obj.set_cache_flags(CacheFlags::PRIVATE);
        assert!(must_revalidate(&obj, &config));
        config.cache_is_shared = false;
        assert!(!must_revalidate(&obj, &config));

        obj.set_cache_flags(CacheFlags::VARY);
        assert!(must_revalidate(&obj, &config));
        config.mindlessly_cache_vary = true;
        assert!(!must_revalidate(&obj, &config));

        obj.set_cache_flags(CacheFlags::COOKIE);
        assert!(!must_revalidate(&obj, &config));
        config.dont_cache_cookies = true;
        assert!(must_revalidate(&obj, &config));
    }
}
