use super::*;

#[test]
fn test_normalize_lowercases_and_replaces() {
    assert_eq!(normalize("Orders"), "orders");
    assert_eq!(normalize("order created!"), "order_created_");
    assert_eq!(normalize("order.*"), "order.*");
    assert_eq!(normalize("a-b>"), "a-b>");
}

#[test]
fn test_build_topic() {
    assert_eq!(
        build_topic("Production", "Orders", "order.created"),
        "production.orders.order.created"
    );
}

#[test]
fn test_build_never_yields_empty_tokens() {
    let topic = build_topic(" ", "orders", "order..created");
    assert_eq!(topic, "_.orders.order._.created");
    assert!(is_valid(&topic));

    let event = build_event("production", "", "invoice", "paid.");
    assert_eq!(event, "production.events._.invoice.paid._");
    assert!(is_valid(&event));
}

#[test]
fn test_build_event() {
    assert_eq!(
        build_event("production", "Billing", "Invoice", "Paid"),
        "production.events.billing.invoice.paid"
    );
}

#[test]
fn test_parse_topic_round_trip() {
    let cases = [
        ("production", "orders", "order.created"),
        ("staging", "billing-api", "invoice"),
        ("dev", "app_1", "a.b.c.d"),
    ];
    for (env, app, topic) in cases {
        let parts = parse_topic(&build_topic(env, app, topic)).unwrap();
        assert_eq!(parts.env, env);
        assert_eq!(parts.app_name, app);
        assert_eq!(parts.topic, topic);
    }
}

#[test]
fn test_parse_topic_rejects_short_or_malformed() {
    assert!(parse_topic("production.orders").is_none());
    assert!(parse_topic("production..orders.x").is_none());
    assert!(parse_topic(".production.orders.x").is_none());
    assert!(parse_topic("Production.orders.x").is_none());
}

#[test]
fn test_parse_event() {
    let parts = parse_event("production.events.billing.invoice.paid").unwrap();
    assert_eq!(
        parts,
        EventParts {
            env: "production".to_string(),
            domain: "billing".to_string(),
            resource: "invoice".to_string(),
            action: "paid".to_string(),
        }
    );
}

#[test]
fn test_parse_event_rejects_wrong_shape() {
    assert!(parse_event("production.orders.billing.invoice.paid").is_none());
    assert!(parse_event("production.events.billing.invoice").is_none());
    assert!(parse_event("production.events.billing.invoice.paid.extra").is_none());
}

#[test]
fn test_matches_single_wildcard() {
    assert!(matches("a.*.c", "a.b.c"));
    assert!(!matches("a.*.c", "a.b.b.c"));
    assert!(!matches("a.*", "a"));
}

#[test]
fn test_matches_tail_wildcard() {
    assert!(matches("a.>", "a.b.c.d"));
    assert!(matches("a.>", "a.b"));
    assert!(!matches("a.>", "b.c"));
    assert!(!matches("a.>", "a"));
}

#[test]
fn test_matches_tail_wildcard_must_be_last() {
    assert!(!matches("a.>.c", "a.b.c"));
}

#[test]
fn test_matches_literal_iff_equal() {
    let pattern = build_topic("production", "orders", "order.created");
    assert!(matches(&pattern, "production.orders.order.created"));
    assert!(!matches(&pattern, "production.orders.order.created.v2"));
    assert!(!matches(&pattern, "production.orders.order"));
    assert!(!matches(&pattern, "staging.orders.order.created"));
}

#[test]
fn test_matches_empty_is_false() {
    assert!(!matches("", "a"));
    assert!(!matches("a", ""));
}

#[test]
fn test_is_valid() {
    assert!(is_valid("production.orders.order.created"));
    assert!(is_valid("production.orders.*"));
    assert!(is_valid("production.>"));
    assert!(!is_valid(""));
    assert!(!is_valid("production.>.x"));
    assert!(!is_valid("production.ord*ers"));
    assert!(!is_valid("production.orders."));
    assert!(!is_valid("Production.orders"));
    assert!(!is_valid("production orders"));
}

#[test]
fn test_intersects() {
    assert!(intersects("a.*.c", "a.b.*"));
    assert!(intersects("a.>", "a.b.c"));
    assert!(intersects("a.b.c", "a.>"));
    assert!(intersects("a.*", "*.b"));
    assert!(!intersects("a.*", "b.*"));
    assert!(!intersects("a.>", "a"));
    assert!(!intersects("a.*", "a.b.c"));
}

#[test]
fn test_is_subset() {
    assert!(is_subset("a.b.c", "a.>"));
    assert!(is_subset("a.b.>", "a.>"));
    assert!(is_subset("a.b", "a.*"));
    assert!(!is_subset("a.>", "a.*"));
    assert!(!is_subset("a.>", "a.b.>"));
    assert!(!is_subset("a", "a.>"));
}

#[test]
fn test_stream_filter_for() {
    assert_eq!(
        stream_filter_for("production.orders.order.created"),
        "production.orders.>"
    );
    assert_eq!(
        stream_filter_for("production.orders.order.*"),
        "production.orders.>"
    );
    assert_eq!(
        stream_filter_for("production.events.billing.invoice.paid"),
        "production.events.>"
    );
    assert_eq!(stream_filter_for("*.orders.x"), "*.orders.x");
}

#[test]
fn test_durable_name_is_deterministic_and_legal() {
    let a = durable_name("orders", "production.orders.order.*");
    let b = durable_name("orders", "production.orders.order.*");
    assert_eq!(a, b);
    assert!(!a.contains(['.', '*', '>']));
    assert!(a.starts_with("orders_production_orders_order_x-"));
}

#[test]
fn test_durable_name_distinguishes_patterns() {
    assert_ne!(
        durable_name("orders", "production.orders.order.*"),
        durable_name("orders", "production.orders.order.>")
    );
    assert_ne!(
        durable_name("orders", "production.orders.a_b"),
        durable_name("orders", "production.orders.a.b")
    );
    assert_ne!(
        durable_name("orders", "production.orders.>"),
        durable_name("billing", "production.orders.>")
    );
}
