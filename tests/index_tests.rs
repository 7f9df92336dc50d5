//! Chain indices and the reputation ranking built on top of them.

mod test_utils;

use powergate::config::{AskIndexConfig, FaultsIndexConfig, MinerIndexConfig};
use powergate::index::AskIndex;
use powergate::index::ask::{Query, state_key};
use powergate::index::{AskRunner, FaultsRunner, MinerRunner};
use powergate::lotus::QueryAsk;
use powergate::reputation::Reputation;
use test_utils::{DealBehavior, FakeLotus, memory_datastore};

#[tokio::test]
async fn ask_index_serves_price_ordered_queries() {
    let lotus = FakeLotus::new(500);
    lotus.add_miner("f01", 10, Some(300), DealBehavior::Activate);
    lotus.add_miner("f02", 10, Some(100), DealBehavior::Activate);
    lotus.add_miner("f03", 10, Some(200), DealBehavior::Activate);
    lotus.add_miner("f04", 10, None, DealBehavior::Activate);
    lotus.add_miner("f05", 0, Some(1), DealBehavior::Activate);
    lotus.set_ask(
        "f03",
        QueryAsk {
            miner: "f03".to_string(),
            price: 200,
            verified_price: 100,
            min_piece_size: 1 << 20,
            max_piece_size: 1 << 30,
            timestamp: 0,
            expiry: 1_000_000,
        },
    );

    let ds = memory_datastore();
    let asks = AskRunner::new(ds.clone(), lotus.clone(), AskIndexConfig::default())
        .await
        .unwrap();
    asks.refresh().await.unwrap();

    let index = asks.get();
    let miners: Vec<_> = index.storage.keys().map(String::as_str).collect();
    assert_eq!(miners, vec!["f01", "f02", "f03"]);
    assert_eq!(index.storage_median_price, 200);
    assert!(index.last_updated.is_some());

    let prices = |q: Query| -> Vec<u64> { asks.query(q).iter().map(|a| a.price).collect() };
    assert_eq!(prices(Query::default()), vec![100, 200, 300]);
    assert_eq!(
        prices(Query {
            max_price: 250,
            ..Query::default()
        }),
        vec![100, 200]
    );
    assert_eq!(
        prices(Query {
            limit: 1,
            offset: 1,
            ..Query::default()
        }),
        vec![200]
    );
    assert_eq!(
        prices(Query {
            piece_size: 1 << 10,
            ..Query::default()
        }),
        vec![100, 300]
    );

    // A fresh runner serves the persisted snapshot before its first refresh.
    let reloaded = AskRunner::new(ds, lotus, AskIndexConfig::default())
        .await
        .unwrap();
    assert_eq!(reloaded.get(), index);
}

#[tokio::test]
async fn persisted_asks_filter_by_min_piece_size() {
    const KIB: u64 = 1024;
    let ask = |miner: &str, price: u64, min_piece_size: u64| QueryAsk {
        miner: miner.to_string(),
        price,
        min_piece_size,
        ..QueryAsk::default()
    };
    let snapshot = AskIndex {
        storage: [
            ask("miner1", 20, 128 * KIB),
            ask("miner2", 30, 64 * KIB),
            ask("miner3", 40, 256 * KIB),
            ask("miner4", 50, 16 * KIB),
        ]
        .into_iter()
        .map(|a| (a.miner.clone(), a))
        .collect(),
        ..AskIndex::default()
    };
    let ds = memory_datastore();
    ds.put(&state_key(), serde_json::to_vec(&snapshot).unwrap())
        .await
        .unwrap();
    let asks = AskRunner::new(ds, FakeLotus::new(0), AskIndexConfig::default())
        .await
        .unwrap();

    let found = asks.query(Query {
        max_price: 35,
        piece_size: 96 * KIB,
        ..Query::default()
    });
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].miner, "miner2");
    assert_eq!(found[0].price, 30);
    assert_eq!(found[0].min_piece_size, 64 * KIB);

    let page: Vec<_> = asks
        .query(Query {
            limit: 2,
            offset: 1,
            ..Query::default()
        })
        .into_iter()
        .map(|a| (a.miner, a.price))
        .collect();
    assert_eq!(
        page,
        vec![("miner2".to_string(), 30), ("miner3".to_string(), 40)]
    );

    // An explicit max size still bounds the query.
    let mut bounded = snapshot.clone();
    if let Some(miner2) = bounded.storage.get_mut("miner2") {
        miner2.max_piece_size = 80 * KIB;
    }
    let ds = memory_datastore();
    ds.put(&state_key(), serde_json::to_vec(&bounded).unwrap())
        .await
        .unwrap();
    let asks = AskRunner::new(ds, FakeLotus::new(0), AskIndexConfig::default())
        .await
        .unwrap();
    assert!(
        asks.query(Query {
            max_price: 35,
            piece_size: 96 * KIB,
            ..Query::default()
        })
        .is_empty()
    );
}

#[tokio::test]
async fn faults_index_waits_for_chain_depth() {
    let lotus = FakeLotus::new(15);
    lotus.add_fault("f01", 3);
    let ds = memory_datastore();
    let faults = FaultsRunner::new(ds.clone(), lotus.clone(), FaultsIndexConfig::default())
        .await
        .unwrap();

    faults.refresh().await.unwrap();
    assert!(faults.get().miners.is_empty());

    lotus.set_height(100);
    faults.refresh().await.unwrap();
    faults.refresh().await.unwrap();
    let index = faults.get();
    assert_eq!(index.miners["f01"].epochs, vec![3]);
    assert!(!index.tipset_key.is_empty());

    let reloaded = FaultsRunner::new(ds, lotus, FaultsIndexConfig::default())
        .await
        .unwrap();
    assert_eq!(reloaded.get(), index);
}

#[tokio::test]
async fn reputation_ranks_by_faults_power_and_price() {
    let lotus = FakeLotus::new(100);
    lotus.add_miner("f01", 100, Some(10), DealBehavior::Activate);
    lotus.add_miner("f02", 60, Some(20), DealBehavior::Activate);
    lotus.add_miner("f03", 40, None, DealBehavior::Activate);

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

    let reputation = Reputation::new(ds, miners.clone(), faults.clone(), asks.clone());
    reputation.rebuild().await.unwrap();
    let top: Vec<_> = reputation
        .get_top_miners(3)
        .unwrap()
        .into_iter()
        .map(|s| s.addr)
        .collect();
    // Miners without an ask aren't ranked.
    assert_eq!(top, vec!["f01", "f02"]);
    assert_eq!(miners.get().on_chain.miners.len(), 3);

    lotus.add_fault("f01", 42);
    faults.refresh().await.unwrap();
    reputation.rebuild().await.unwrap();
    let top = reputation.get_top_miners(1).unwrap();
    assert_eq!(top[0].addr, "f02");

    let excluded = reputation.query_miners(&["f02".to_string()], &[], &[]);
    assert_eq!(excluded.len(), 1);
    assert_eq!(excluded[0].addr, "f01");
    assert!(reputation.get_top_miners(0).is_err());
}
