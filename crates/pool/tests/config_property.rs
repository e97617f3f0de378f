//! Property tests for configuration normalization.

use lspool::config::{self, DEFAULT_REQUEST_TERMINATE_TIMEOUT};
use lspool::{Config, Error, RawConfig};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn unit() -> impl Strategy<Value = char> {
    prop_oneof![Just('d'), Just('h'), Just('m'), Just('s')]
}

proptest! {
    #[test]
    fn start_num_stays_within_capacity(max in 1i64..10_000, start in any::<i64>()) {
        let max_num = config::max_num(max);
        let start_num = config::start_num(max_num, start);
        prop_assert!(start_num >= 1);
        prop_assert!(start_num <= max_num);
    }

    #[test]
    fn start_num_out_of_range_becomes_half_plus_one(max in 1i64..10_000, over in 1i64..1_000) {
        let max_num = config::max_num(max);
        prop_assert_eq!(config::start_num(max_num, max + over), max_num / 2 + 1);
        prop_assert_eq!(config::start_num(max_num, -over), max_num / 2 + 1);
    }

    #[test]
    fn unbounded_pool_keeps_positive_start(start in 1i64..100_000) {
        prop_assert_eq!(config::start_num(0, start), start as usize);
    }

    #[test]
    fn negative_values_fall_back(n in i64::MIN..0) {
        prop_assert_eq!(config::max_num(n), 0);
        prop_assert_eq!(config::max_request(n), 0);
        prop_assert_eq!(config::start_num(0, n), 1);
        prop_assert_eq!(config::request_terminate_timeout(n), DEFAULT_REQUEST_TERMINATE_TIMEOUT);
    }

    #[test]
    fn non_negative_values_pass_through(n in 0i64..i64::MAX) {
        prop_assert_eq!(config::max_num(n), n as usize);
        prop_assert_eq!(config::max_request(n), n as u64);
        prop_assert_eq!(config::request_terminate_timeout(n), n as u64);
    }

    #[test]
    fn idle_timeout_splits_number_and_unit(n in 0i64..1_000_000, u in unit()) {
        let (num, parsed_unit) = config::idle_timeout(&format!("{n}{u}")).unwrap();
        prop_assert_eq!(num, n);
        prop_assert_eq!(parsed_unit, u);
    }

    #[test]
    fn negative_idle_timeout_resets_to_one(n in 1i64..1_000_000, u in unit()) {
        let (num, parsed_unit) = config::idle_timeout(&format!("-{n}{u}")).unwrap();
        prop_assert_eq!(num, 1);
        prop_assert_eq!(parsed_unit, u);
    }

    #[test]
    fn unknown_unit_is_a_format_error(n in 0i64..1_000, u in "[a-ce-gi-lnortu-z]") {
        let err = config::idle_timeout(&format!("{n}{u}")).unwrap_err();
        prop_assert!(matches!(err, Error::IdleTimeoutFormat { .. }), "got {:?}", err);
    }

    #[test]
    fn idle_seconds_scale_by_unit(n in 1i64..10_000) {
        prop_assert_eq!(config::idle_timeout_seconds(n, 's'), n as u64);
        prop_assert_eq!(config::idle_timeout_seconds(n, 'm'), n as u64 * 60);
        prop_assert_eq!(config::idle_timeout_seconds(n, 'h'), n as u64 * 3_600);
        prop_assert_eq!(config::idle_timeout_seconds(n, 'd'), n as u64 * 86_400);
    }

    #[test]
    fn validated_config_never_exceeds_capacity(
        max in -10i64..50,
        start in -10i64..100,
        req in -10i64..1_000,
    ) {
        let cfg = Config::new(max, start, req, 30, "10m").unwrap();
        if cfg.max_num() > 0 {
            prop_assert!(cfg.start_num() <= cfg.max_num());
        }
        prop_assert!(cfg.start_num() >= 1);
    }
}

#[test]
fn too_short_idle_timeout_is_rejected() {
    for value in ["", "h", "5"] {
        let err = config::idle_timeout(value).unwrap_err();
        assert!(matches!(err, Error::IdleTimeoutFormat { .. }), "{value:?} gave {err:?}");
    }
}

#[test]
fn non_numeric_idle_timeout_is_rejected() {
    let err = config::idle_timeout("abch").unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }), "got {err:?}");
}

#[test]
fn json_config_fills_defaults() {
    let cfg = Config::from_json(r#"{ "max_num": 8, "idle_timeout": "30m" }"#).unwrap();
    assert_eq!(cfg.max_num(), 8);
    assert_eq!(cfg.start_num(), 1);
    assert_eq!(cfg.max_request(), 0);
    assert_eq!(cfg.idle_timeout_secs(), 1_800);
    assert_eq!(cfg.request_terminate_timeout(), 120);
}

#[test]
fn raw_config_default_matches_config_default() {
    let from_raw = Config::try_from(RawConfig::default()).unwrap();
    let default = Config::default();
    assert_eq!(from_raw.max_num(), default.max_num());
    assert_eq!(from_raw.start_num(), default.start_num());
    assert_eq!(from_raw.idle_timeout_secs(), 3_600);
}

#[test]
fn malformed_json_is_a_configuration_error() {
    let err = Config::from_json("{ max_num: ").unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }), "got {err:?}");
}
