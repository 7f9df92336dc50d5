//! Miner selection strategies against fake chain state.

mod test_utils;

use std::collections::BTreeSet;
use std::time::Duration;

use powergate::config::{AskIndexConfig, FaultsIndexConfig, MinerIndexConfig};
use powergate::error::Error;
use powergate::ffs::minerselector::{RepTop, Sr2};
use powergate::ffs::{MinerSelector, MinerSelectorFilter};
use powergate::index::{AskRunner, FaultsRunner, MinerRunner};
use powergate::reputation::Reputation;
use test_utils::{DealBehavior, FakeLotus, memory_datastore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn reptop(lotus: std::sync::Arc<FakeLotus>) -> RepTop {
    let ds = memory_datastore();
    let asks = AskRunner::new(ds.clone(), lotus.clone(), AskIndexConfig::default())
        .await
        .unwrap();
    let miners = MinerRunner::new(ds.clone(), lotus.clone(), None, MinerIndexConfig::default())
        .await
        .unwrap();
    let faults = FaultsRunner::new(ds.clone(), lotus.clone(), FaultsIndexConfig::default())
        .await
        .unwrap();
    asks.refresh().await.unwrap();
    miners.refresh_on_chain().await.unwrap();
    let reputation = Reputation::new(ds, miners, faults, asks);
    reputation.rebuild().await.unwrap();
    RepTop::new(reputation, lotus).with_ask_timeout(Duration::from_secs(1))
}

#[tokio::test]
async fn reptop_prefers_trusted_then_ranked_miners() {
    let lotus = FakeLotus::new(100);
    lotus.add_miner("f01", 100, Some(10), DealBehavior::Activate);
    lotus.add_miner("f02", 50, Some(20), DealBehavior::Activate);
    lotus.add_miner("f03", 10, Some(40), DealBehavior::Activate);
    let selector = reptop(lotus).await;

    let picked = selector
        .get_miners(2, &MinerSelectorFilter::default())
        .await
        .unwrap();
    let addrs: Vec<_> = picked.iter().map(|p| p.addr.as_str()).collect();
    assert_eq!(addrs, vec!["f01", "f02"]);
    assert_eq!(picked[0].epoch_price, 10);

    let filter = MinerSelectorFilter {
        trusted_miners: vec!["f03".to_string()],
        excluded_miners: vec!["f01".to_string()],
        ..MinerSelectorFilter::default()
    };
    let picked = selector.get_miners(2, &filter).await.unwrap();
    let addrs: Vec<_> = picked.iter().map(|p| p.addr.as_str()).collect();
    assert_eq!(addrs, vec!["f03", "f02"]);

    let capped = MinerSelectorFilter {
        max_price: 15,
        ..MinerSelectorFilter::default()
    };
    let err = selector.get_miners(2, &capped).await.unwrap_err();
    assert!(matches!(err, Error::NotEnoughMiners { wanted: 2, found: 1 }));
    assert!(matches!(
        selector.get_miners(0, &capped).await,
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn sr2_draws_the_bucket_amounts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buckets.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "buckets": [
                { "amount": 1, "minerAddresses": ["f01", "f02"] },
                { "amount": 1, "minerAddresses": ["f03"] }
            ]
        })))
        .mount(&server)
        .await;

    let lotus = FakeLotus::new(100);
    lotus.add_miner("f01", 10, Some(10), DealBehavior::Activate);
    lotus.add_miner("f02", 10, Some(20), DealBehavior::Activate);
    lotus.add_miner("f03", 10, Some(30), DealBehavior::Activate);
    let selector = Sr2::new(&format!("{}/buckets.json", server.uri()), lotus, None)
        .await
        .unwrap();

    assert_eq!(selector.get_replication_factor().await.unwrap(), Some(2));

    let filter = MinerSelectorFilter {
        excluded_miners: vec!["f02".to_string()],
        ..MinerSelectorFilter::default()
    };
    let picked: BTreeSet<_> = selector
        .get_miners(2, &filter)
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.addr, p.epoch_price))
        .collect();
    assert_eq!(
        picked,
        BTreeSet::from([("f01".to_string(), 10), ("f03".to_string(), 30)])
    );

    let capped = MinerSelectorFilter {
        max_price: 25,
        ..MinerSelectorFilter::default()
    };
    let err = selector.get_miners(2, &capped).await.unwrap_err();
    assert!(matches!(err, Error::NotEnoughMiners { .. }));
}

#[tokio::test]
async fn sr2_requires_reachable_buckets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let lotus = FakeLotus::new(100);
    assert!(Sr2::new(&server.uri(), lotus.clone(), None).await.is_err());
    assert!(matches!(
        Sr2::new("not a url", lotus, None).await,
        Err(Error::InvalidConfig(_))
    ));
}
