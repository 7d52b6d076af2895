//! Gatekeeper cache persistence across a simulated reboot, and the
//! serializer's idempotence guarantee.

use flowmon::gatekeeper::persist::{self, RestoreCounts};
use flowmon::gatekeeper::{
    Attribute, CacheEntry, DirStore, GkAction, GkCache, HostnameOrigin, PersistentStore,
    RedirectInfo, GK_STORE_KEY, GK_STORE_NAME,
};

fn fqdn_entry() -> CacheEntry {
    CacheEntry {
        device_mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        attribute: Attribute::Hostname(HostnameOrigin::Fqdn, "www.example.com".into()),
        action: GkAction::Block,
        ttl: 600,
        policy: "parental".into(),
        category_id: 17,
        confidence: 80,
        flow_marker: 0,
        network_id: "home".into(),
        redirect: None,
    }
}

#[test]
fn cache_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    // first boot: populate, serialize, persist
    {
        let mut cache = GkCache::new();
        cache.add_entry(fqdn_entry());
        let image = persist::serialize_cache(&cache);
        let mut store = DirStore::new(dir.path());
        persist::persist(&mut store, &image);
    }

    // restart: a fresh cache restores from the same store
    let mut cache = GkCache::new();
    let store = DirStore::new(dir.path());
    let counts = persist::restore(&mut cache, &store);
    assert_eq!(
        counts,
        RestoreCounts {
            added: 1,
            failed: 0
        }
    );

    let mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
    let v = cache
        .lookup(
            &mac,
            &Attribute::Hostname(HostnameOrigin::Fqdn, "www.example.com".into()),
        )
        .expect("entry restored");
    assert_eq!(v.action, GkAction::Block);
    assert_eq!(v.ttl, 600);
    assert_eq!(v.category_id, 17);
    assert_eq!(v.confidence, 80);
    assert_eq!(v.policy, "parental");
    assert_eq!(v.network_id, "home");
}

#[test]
fn serializer_is_idempotent_across_kinds() {
    let mut cache = GkCache::new();
    cache.add_entry(fqdn_entry());
    cache.add_entry(CacheEntry {
        attribute: Attribute::Url("https://cdn.example/asset".into()),
        ..fqdn_entry()
    });
    cache.add_entry(CacheEntry {
        attribute: Attribute::Hostname(HostnameOrigin::HttpsSni, "sni.example.net".into()),
        ..fqdn_entry()
    });
    cache.add_entry(CacheEntry {
        device_mac: "00:11:22:33:44:55".parse().unwrap(),
        attribute: Attribute::Ipv6([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
        ..fqdn_entry()
    });
    cache.add_entry(CacheEntry {
        attribute: Attribute::App("p2p_client".into()),
        ..fqdn_entry()
    });

    let first = persist::serialize_cache(&cache);
    let mut round = GkCache::new();
    persist::restore_image(&mut round, &first).unwrap();
    let second = persist::serialize_cache(&round);
    assert_eq!(first, second);

    // and the trip is lossless
    assert_eq!(round.entry_count(), cache.entry_count());
    assert_eq!(round.device_count(), cache.device_count());
}

#[test]
fn fqdn_redirect_descriptor_round_trips() {
    let mut cache = GkCache::new();
    cache.add_entry(CacheEntry {
        action: GkAction::Redirect,
        redirect: Some(RedirectInfo {
            redirect_ipv4: Some([203, 0, 113, 7]),
            redirect_ipv6: None,
            redirect_cname: Some("block.gateway".into()),
        }),
        ..fqdn_entry()
    });

    let image = persist::serialize_cache(&cache);
    let mut restored = GkCache::new();
    persist::restore_image(&mut restored, &image).unwrap();

    let mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
    let v = restored
        .lookup(
            &mac,
            &Attribute::Hostname(HostnameOrigin::Fqdn, "www.example.com".into()),
        )
        .unwrap();
    let redirect = v.redirect.as_ref().unwrap();
    assert_eq!(redirect.redirect_ipv4, Some([203, 0, 113, 7]));
    assert_eq!(redirect.redirect_cname.as_deref(), Some("block.gateway"));
}

#[test]
fn persist_overwrites_the_previous_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DirStore::new(dir.path());

    let mut cache = GkCache::new();
    cache.add_entry(fqdn_entry());
    persist::persist(&mut store, &persist::serialize_cache(&cache));

    cache.add_entry(CacheEntry {
        attribute: Attribute::App("new_app".into()),
        ..fqdn_entry()
    });
    persist::persist(&mut store, &persist::serialize_cache(&cache));

    let image = store.read(GK_STORE_NAME, GK_STORE_KEY).unwrap().unwrap();
    let mut restored = GkCache::new();
    let counts = persist::restore_image(&mut restored, &image).unwrap();
    assert_eq!(counts.added, 2);
}
