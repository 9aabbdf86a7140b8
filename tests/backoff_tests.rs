use reflow::backoff::BackoffPolicy;

#[test]
fn default_policy_doubles_from_500ms() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay_ms(0), 500);
    assert_eq!(policy.delay_ms(1), 1_000);
    assert_eq!(policy.delay_ms(2), 2_000);
    assert_eq!(policy.delay_ms(6), 32_000);
}

#[test]
fn default_policy_clamps_to_thirty_minutes_past_one_minute() {
    let policy = BackoffPolicy::default();
    // 500ms * 2^7 = 64s exceeds the one minute threshold
    assert_eq!(policy.delay_ms(7), 30 * 60 * 1_000);
    assert_eq!(policy.delay_ms(8), 30 * 60 * 1_000);
    assert_eq!(policy.delay_ms(100), 30 * 60 * 1_000);
}

#[test]
fn delay_at_threshold_is_not_clamped() {
    let policy = BackoffPolicy {
        initial_ms: 1_000,
        factor: 2.0,
        clamp_threshold_ms: 4_000,
        ceiling_ms: 99_000,
    };
    assert_eq!(policy.delay_ms(2), 4_000);
    assert_eq!(policy.delay_ms(3), 99_000);
}

#[test]
fn policy_deserializes_with_defaults() {
    let policy: BackoffPolicy = toml::from_str("").unwrap();
    assert_eq!(policy, BackoffPolicy::default());

    let policy: BackoffPolicy = toml::from_str("initial_ms = 10\nceiling_ms = 50").unwrap();
    assert_eq!(policy.initial_ms, 10);
    assert_eq!(policy.ceiling_ms, 50);
    assert_eq!(policy.factor, 2.0);
}
