//! Filter engine behavior through the config surface: layer-2 rules,
//! rule-order independence of decisions, and app-tag predicates.

use flowmon::config::FilterRuleConfig;
use flowmon::filter::{FilterEngine, FilterReq, L2Info, L3Info, PacketStats};

fn l2_rule_config() -> FilterRuleConfig {
    FilterRuleConfig {
        name: "dev_filter".into(),
        index: 1,
        smac: vec!["11:22:33:44:55:66".into()],
        smac_op: Some("in".into()),
        dmac: vec!["a6:55:44:33:22:1a".into()],
        dmac_op: Some("in".into()),
        pktcnt: Some(20),
        pktcnt_op: Some("gt".into()),
        action: Some("include".into()),
        ..Default::default()
    }
}

fn catch_all_exclude(index: u32) -> FilterRuleConfig {
    FilterRuleConfig {
        name: "dev_filter".into(),
        index,
        action: Some("exclude".into()),
        ..Default::default()
    }
}

fn req<'a>(l2: &'a L2Info, pkts: &'a PacketStats) -> FilterReq<'a> {
    FilterReq {
        l2: Some(l2),
        pkts: Some(pkts),
        ..Default::default()
    }
}

#[test]
fn layer2_rule_includes_matching_traffic_only() {
    let mut engine = FilterEngine::new();
    engine.upsert_rule("dev_filter", l2_rule_config().to_rule());
    engine.upsert_rule("dev_filter", catch_all_exclude(9).to_rule());

    let l2 = L2Info {
        src_mac: Some("11:22:33:44:55:66".into()),
        dst_mac: Some("a6:55:44:33:22:1a".into()),
        ..Default::default()
    };
    let heavy = PacketStats {
        pkt_cnt: Some(50),
        bytes: None,
    };
    let light = PacketStats {
        pkt_cnt: Some(10),
        bytes: None,
    };
    assert!(engine.apply("dev_filter", &req(&l2, &heavy)));
    assert!(!engine.apply("dev_filter", &req(&l2, &light)));

    let unlisted = L2Info {
        src_mac: Some("de:ad:be:ef:00:01".into()),
        dst_mac: Some("a6:55:44:33:22:1a".into()),
        ..Default::default()
    };
    assert!(!engine.apply("dev_filter", &req(&unlisted, &heavy)));
}

#[test]
fn decision_is_independent_of_later_rules() {
    let l2 = L2Info {
        src_mac: Some("11:22:33:44:55:66".into()),
        dst_mac: Some("a6:55:44:33:22:1a".into()),
        ..Default::default()
    };
    let pkts = PacketStats {
        pkt_cnt: Some(50),
        bytes: None,
    };

    let mut short = FilterEngine::new();
    short.upsert_rule("f", l2_rule_config().to_rule());

    let mut long = FilterEngine::new();
    long.upsert_rule("f", l2_rule_config().to_rule());
    long.upsert_rule("f", catch_all_exclude(5).to_rule());
    long.upsert_rule("f", catch_all_exclude(6).to_rule());

    assert_eq!(
        short.apply("f", &req(&l2, &pkts)),
        long.apply("f", &req(&l2, &pkts))
    );
}

#[test]
fn unknown_table_allows_everything() {
    let engine = FilterEngine::new();
    assert!(engine.apply("absent", &FilterReq::default()));
}

#[test]
fn l3_predicates_apply_port_ranges() {
    let mut engine = FilterEngine::new();
    engine.upsert_rule(
        "ports",
        FilterRuleConfig {
            name: "ports".into(),
            index: 1,
            dst_port: vec!["53".into(), "8000-9000".into()],
            dst_port_op: Some("in".into()),
            action: Some("include".into()),
            ..Default::default()
        }
        .to_rule(),
    );
    engine.upsert_rule("ports", catch_all_exclude(2).to_rule());

    let dns = L3Info {
        dport: Some(53),
        ..Default::default()
    };
    let high = L3Info {
        dport: Some(8500),
        ..Default::default()
    };
    let other = L3Info {
        dport: Some(443),
        ..Default::default()
    };
    let apply = |l3: &L3Info| {
        let req = FilterReq {
            l3: Some(l3),
            ..Default::default()
        };
        engine.apply("ports", &req)
    };
    assert!(apply(&dns));
    assert!(apply(&high));
    assert!(!apply(&other));
}

#[test]
fn app_tag_predicates_use_flow_tag_context() {
    let mut engine = FilterEngine::new();
    engine.upsert_rule(
        "apps",
        FilterRuleConfig {
            name: "apps".into(),
            index: 1,
            apptags: vec!["streaming".into()],
            apptag_op: Some("in".into()),
            action: Some("include".into()),
            ..Default::default()
        }
        .to_rule(),
    );
    engine.upsert_rule("apps", catch_all_exclude(2).to_rule());

    let tagged = ["streaming".to_string()];
    let other = ["gaming".to_string()];
    let with_tags = FilterReq {
        app_tags: &tagged,
        ..Default::default()
    };
    let without = FilterReq {
        app_tags: &other,
        ..Default::default()
    };
    assert!(engine.apply("apps", &with_tags));
    assert!(!engine.apply("apps", &without));
}

#[test]
fn rule_deletion_empties_the_table() {
    let mut engine = FilterEngine::new();
    engine.upsert_rule("f", catch_all_exclude(1).to_rule());
    assert!(!engine.apply("f", &FilterReq::default()));
    engine.remove_rule("f", 1);
    assert!(engine.apply("f", &FilterReq::default()));
}
