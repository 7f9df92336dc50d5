//! End-to-end storage and retrieval flows through the scheduler, the
//! executor, IPFS hot storage and Filecoin cold storage, against in-process
//! Lotus and IPFS fakes.

mod test_utils;

use std::time::Duration;

use powergate::error::Error;
use powergate::ffs::scheduler::{ListConfig, PushOptions, RetrievalRequest, Scheduler, sjstore};
use powergate::ffs::{
    JobId, JobStatus, NotificationConfig, StorageConfig, StorageJob, UserId, Webhook,
};
use powergate::lotus::{Cid, DealState, QueryOffer};
use test_utils::{
    DealBehavior, FakeLotus, FixedSelector, Harness, memory_datastore, wait_for_final,
    wait_for_status,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cold_only(rep_factor: usize) -> StorageConfig {
    StorageConfig::default()
        .with_hot_enabled(false)
        .with_rep_factor(rep_factor)
}

async fn wait_for_started_deals(lotus: &FakeLotus, n: usize) {
    for _ in 0..250 {
        if lotus.started_deals().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {n} started deals, got {}", lotus.started_deals().len());
}

/// Proposal of the first deal update recorded on the job.
async fn wait_for_proposal(scheduler: &Scheduler, job_id: &JobId) -> Cid {
    for _ in 0..250 {
        let job = scheduler.get_storage_job(job_id).await.unwrap();
        if let Some(deal) = job.deal_info.first() {
            return deal.proposal_cid.clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never recorded a deal update");
}

async fn jobs_for(scheduler: &Scheduler, user: &UserId, cid: &Cid) -> Vec<StorageJob> {
    scheduler
        .list_storage_jobs(ListConfig {
            user_id: Some(user.clone()),
            cid: Some(cid.clone()),
            ascending: true,
            ..ListConfig::default()
        })
        .await
        .unwrap()
        .jobs
}

#[tokio::test]
async fn single_replica_is_pinned_stored_and_notified() {
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(serde_json::json!({
            "miner": "m1",
            "dealStatus": "StorageDealActive"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(serde_json::json!({ "jobStatus": "Success" })))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webhook)
        .await;

    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(500), DealBehavior::Activate);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 500)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"single replica payload");

    let cfg = StorageConfig::default()
        .with_max_price(1000)
        .with_notifications(vec![NotificationConfig {
            webhook: Webhook {
                url: format!("{}/hook", webhook.uri()),
                ..Webhook::default()
            },
            events: vec!["storage-deal-completed".to_string()],
            alerts: Vec::new(),
        }]);
    let job_id = harness
        .scheduler
        .push_storage_config(&user, &cid, cfg, PushOptions::default())
        .await
        .unwrap()
        .expect("job scheduled");

    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success, "failed with {}", job.err_cause);
    assert!(job.deal_errors.is_empty());

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    assert!(info.hot.enabled);
    let proposals = &info.cold.filecoin.proposals;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].miner, "m1");
    assert_eq!(proposals[0].epoch_price, 500);
    assert_ne!(proposals[0].deal_id, 0);

    let pinstore = harness.hot.pinstore();
    assert!(pinstore.is_pinned_by(&user, &cid).await);
    assert_eq!(pinstore.ref_count(&cid).await, (1, 0));
    assert!(harness.ipfs.is_node_pinned(&cid));

    let started = harness.lotus.started_deals();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].wallet, test_utils::WALLET);

    harness.close().await;
    webhook.verify().await;
}

#[tokio::test]
async fn rejected_replica_fails_job_but_keeps_active_deals() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Activate);
    lotus.add_miner("m2", 100, Some(10), DealBehavior::RejectProposal);
    lotus.add_miner("m3", 100, Some(10), DealBehavior::Activate);
    let selector = FixedSelector::new(&[("m1", 10), ("m2", 10), ("m3", 10)]);
    let harness = Harness::start(memory_datastore(), lotus, selector).await.unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"three replicas");

    let job_id = harness
        .scheduler
        .push_storage_config(&user, &cid, StorageConfig::default().with_rep_factor(3), PushOptions::default())
        .await
        .unwrap()
        .unwrap();

    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.deal_errors.iter().any(|e| e.miner == "m2"));

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    let mut miners: Vec<_> = info
        .cold
        .filecoin
        .proposals
        .iter()
        .map(|p| p.miner.as_str())
        .collect();
    miners.sort();
    assert_eq!(miners, vec!["m1", "m3"]);

    harness.scheduler.evaluate_repairs().await;
    assert!(
        harness
            .scheduler
            .queued_storage_jobs(Some(&user), &[cid.clone()])
            .await
            .unwrap()
            .is_empty()
    );
    harness.close().await;
}

#[tokio::test]
async fn canceling_executing_job_records_sent_proposals() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Hang);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness
        .scheduler
        .stage(&user, b"long running".to_vec())
        .await
        .unwrap();
    assert_eq!(harness.hot.pinstore().ref_count(&cid).await, (1, 1));

    let job_id = harness
        .scheduler
        .push_storage_config(&user, &cid, StorageConfig::default(), PushOptions::default())
        .await
        .unwrap()
        .unwrap();
    wait_for_status(&harness.scheduler, &job_id, JobStatus::Executing, Duration::from_secs(5))
        .await
        .unwrap();
    for _ in 0..100 {
        if !harness.lotus.started_deals().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.lotus.started_deals().len(), 1);

    harness.scheduler.cancel(&job_id).await.unwrap();
    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.deal_errors.iter().any(|e| e.proposal_cid.is_some()));

    // A second cancel is a no-op on a terminal job.
    harness.scheduler.cancel(&job_id).await.unwrap();
    assert_eq!(
        harness.scheduler.get_storage_job(&job_id).await.unwrap().status,
        JobStatus::Canceled
    );
    assert_eq!(harness.hot.pinstore().ref_count(&cid).await, (1, 0));
    harness.close().await;
}

#[tokio::test]
async fn disabled_config_succeeds_without_touching_storage() {
    let harness = Harness::start(memory_datastore(), FakeLotus::new(1000), FixedSelector::new(&[]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"nowhere");
    let cfg = StorageConfig::default()
        .with_hot_enabled(false)
        .with_cold_enabled(false);

    let job_id = harness
        .scheduler
        .push_storage_config(&user, &cid, cfg, PushOptions::default())
        .await
        .unwrap()
        .unwrap();
    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    assert!(info.cold.filecoin.proposals.is_empty());
    assert!(harness.ipfs.calls().is_empty());
    harness.close().await;
}

#[tokio::test]
async fn push_rules_guard_existing_configs() {
    let harness = Harness::start(memory_datastore(), FakeLotus::new(1000), FixedSelector::new(&[]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = Cid::from("bafypushrules");
    let opts = PushOptions {
        no_exec: true,
        ..PushOptions::default()
    };

    let first = harness
        .scheduler
        .push_storage_config(&user, &cid, cold_only(1), opts)
        .await
        .unwrap();
    assert!(first.is_none());
    assert!(harness.scheduler.queued_storage_jobs(Some(&user), &[]).await.unwrap().is_empty());

    let err = harness
        .scheduler
        .push_storage_config(&user, &cid, cold_only(1), opts)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyConfigured));

    let err = harness.scheduler.remove(&user, &cid).await.unwrap_err();
    assert!(matches!(err, Error::ActiveInStorage));

    let overridden = PushOptions {
        override_config: true,
        no_exec: true,
    };
    let disabled = StorageConfig::default()
        .with_hot_enabled(false)
        .with_cold_enabled(false);
    harness
        .scheduler
        .push_storage_config(&user, &cid, disabled, overridden)
        .await
        .unwrap();
    harness.scheduler.remove(&user, &cid).await.unwrap();
    assert!(matches!(
        harness.scheduler.get_storage_config(&user, &cid).await,
        Err(Error::NotFound(_))
    ));

    let err = harness
        .scheduler
        .push_storage_config(&user, &cid, cold_only(0), PushOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    harness.close().await;
}

#[tokio::test]
async fn not_enough_miners_fails_the_job() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Activate);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"two replicas wanted");

    let job_id = harness
        .scheduler
        .push_storage_config(&user, &cid, cold_only(2), PushOptions::default())
        .await
        .unwrap()
        .unwrap();
    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(harness.lotus.started_deals().is_empty());
    harness.close().await;
}

#[tokio::test]
async fn replace_moves_config_and_hot_pin() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Activate);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let old = harness.ipfs.put_block(b"version one");
    let new = harness.ipfs.put_block(b"version two");
    let cfg = StorageConfig::default().with_cold_enabled(false);

    let first = harness
        .scheduler
        .push_storage_config(&user, &old, cfg, PushOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        wait_for_final(&harness.scheduler, &first).await.unwrap().status,
        JobStatus::Success
    );

    let err = harness.scheduler.push_replace(&user, &old, &old).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let job_id = harness.scheduler.push_replace(&user, &old, &new).await.unwrap();
    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success, "failed with {}", job.err_cause);

    assert!(harness.scheduler.get_storage_config(&user, &new).await.is_ok());
    assert!(harness.scheduler.get_storage_config(&user, &old).await.is_err());
    assert!(harness.hot.pinstore().is_pinned_by(&user, &new).await);
    assert!(!harness.hot.pinstore().is_pinned_by(&user, &old).await);
    harness.close().await;
}

#[tokio::test]
async fn latest_final_jobs_cover_every_pushed_cid() {
    let lotus = FakeLotus::new(1000);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cfg = StorageConfig::default().with_cold_enabled(false);

    let mut jobs = Vec::new();
    for i in 0..4 {
        let cid = harness.ipfs.put_block(format!("fifo {i}").as_bytes());
        let id = harness
            .scheduler
            .push_storage_config(&user, &cid, cfg.clone(), PushOptions::default())
            .await
            .unwrap()
            .unwrap();
        jobs.push(id);
    }
    for id in &jobs {
        assert_eq!(
            wait_for_final(&harness.scheduler, id).await.unwrap().status,
            JobStatus::Success
        );
    }

    let mut finished: Vec<_> = harness
        .scheduler
        .latest_final_storage_jobs(Some(&user), &[])
        .await
        .unwrap();
    finished.sort_by_key(|j| j.created_at);
    let ids: Vec<_> = finished.into_iter().map(|j| j.id).collect();
    assert_eq!(ids, jobs);
    harness.close().await;
}

#[tokio::test]
async fn retrieval_pays_cheapest_offer() {
    let lotus = FakeLotus::new(1000);
    let data_cid = Cid::from("bafyretrieve");
    for (miner, price) in [("m1", 90), ("m2", 40)] {
        lotus.add_offer(QueryOffer {
            root: data_cid.clone(),
            size: 2048,
            min_price: price,
            miner: miner.to_string(),
            miner_peer_id: format!("peer-{miner}"),
            ..QueryOffer::default()
        });
    }
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[]))
        .await
        .unwrap();
    let user = UserId::from("u1");

    let job_id = harness
        .scheduler
        .start_retrieval(
            &user,
            RetrievalRequest {
                data_cid: data_cid.clone(),
                ..RetrievalRequest::default()
            },
        )
        .await
        .unwrap();

    let mut job = harness.scheduler.get_retrieval_job(&job_id).await.unwrap();
    for _ in 0..250 {
        if job.status.is_final() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        job = harness.scheduler.get_retrieval_job(&job_id).await.unwrap();
    }
    assert_eq!(job.status, JobStatus::Success, "failed with {}", job.err_cause);
    let orders = harness.lotus.retrievals();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].miner, "m2");
    assert_eq!(orders[0].client, test_utils::WALLET);
    harness.close().await;
}

#[tokio::test]
async fn override_push_waits_for_executing_job_to_cancel() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Hang);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"overridden while executing");

    let first = harness
        .scheduler
        .push_storage_config(&user, &cid, StorageConfig::default(), PushOptions::default())
        .await
        .unwrap()
        .unwrap();
    wait_for_status(&harness.scheduler, &first, JobStatus::Executing, Duration::from_secs(5))
        .await
        .unwrap();
    wait_for_started_deals(&harness.lotus, 1).await;

    let overridden = PushOptions {
        override_config: true,
        ..PushOptions::default()
    };
    let second = harness
        .scheduler
        .push_storage_config(&user, &cid, StorageConfig::default().with_cold_enabled(false), overridden)
        .await
        .unwrap()
        .unwrap();

    // The previous job is terminal before the new one is visible.
    let old = harness.scheduler.get_storage_job(&first).await.unwrap();
    assert_eq!(old.status, JobStatus::Canceled);
    let active: Vec<_> = jobs_for(&harness.scheduler, &user, &cid)
        .await
        .into_iter()
        .filter(|j| !j.status.is_final())
        .map(|j| j.id)
        .collect();
    assert!(active.iter().all(|id| *id == second));

    let job = wait_for_final(&harness.scheduler, &second).await.unwrap();
    assert_eq!(job.status, JobStatus::Success, "failed with {}", job.err_cause);
    harness.close().await;
}

#[tokio::test]
async fn restart_fails_interrupted_job_without_deals() {
    let ds = memory_datastore();
    let user = UserId::from("u1");
    let disabled = StorageConfig::default()
        .with_hot_enabled(false)
        .with_cold_enabled(false);
    let interrupted = StorageJob {
        id: JobId::from("interrupted"),
        user_id: user.clone(),
        cid: Cid::from("bafyinterrupted"),
        status: JobStatus::Executing,
        created_at: 1,
        config: disabled,
        ..StorageJob::default()
    };
    let next = StorageJob {
        id: JobId::from("next"),
        cid: Cid::from("bafynext"),
        status: JobStatus::Queued,
        created_at: 2,
        ..interrupted.clone()
    };
    for job in [&interrupted, &next] {
        ds.put(
            &sjstore::job_key().child(job.id.as_str()),
            serde_json::to_vec(job).unwrap(),
        )
        .await
        .unwrap();
    }

    let harness = Harness::start(ds, FakeLotus::new(1000), FixedSelector::new(&[]))
        .await
        .unwrap();
    let failed = harness.scheduler.get_storage_job(&interrupted.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.err_cause, "restart");

    // The user's queue isn't blocked by the failed job.
    let job = wait_for_final(&harness.scheduler, &next.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success, "failed with {}", job.err_cause);
    harness.close().await;
}

#[tokio::test]
async fn restart_resumes_watching_started_deals() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Hang);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"survives a restart");

    let job_id = harness
        .scheduler
        .push_storage_config(&user, &cid, StorageConfig::default(), PushOptions::default())
        .await
        .unwrap()
        .unwrap();
    wait_for_started_deals(&harness.lotus, 1).await;
    let proposal = wait_for_proposal(&harness.scheduler, &job_id).await;

    let harness = harness.restart().await.unwrap();
    let resumed = harness.scheduler.get_storage_job(&job_id).await.unwrap();
    assert!(!resumed.status.is_final(), "job ended {}", resumed.status);

    harness.lotus.settle_deal(&proposal, DealState::Active);
    let job = wait_for_final(&harness.scheduler, &job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success, "failed with {}", job.err_cause);
    assert_eq!(harness.lotus.started_deals().len(), 1);

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    let proposals = &info.cold.filecoin.proposals;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].proposal_cid, proposal);
    harness.close().await;
}

#[tokio::test]
async fn slashed_deal_schedules_one_repair_job() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Activate);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"needs repair");

    let first = harness
        .scheduler
        .push_storage_config(
            &user,
            &cid,
            StorageConfig::default().with_repairable(true),
            PushOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        wait_for_final(&harness.scheduler, &first).await.unwrap().status,
        JobStatus::Success
    );

    harness.scheduler.evaluate_repairs().await;
    assert_eq!(jobs_for(&harness.scheduler, &user, &cid).await.len(), 1);

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    let slashed = info.cold.filecoin.proposals[0].proposal_cid.clone();
    harness.lotus.settle_deal(&slashed, DealState::Slashed);

    harness.scheduler.evaluate_repairs().await;
    harness.scheduler.evaluate_repairs().await;
    let jobs = jobs_for(&harness.scheduler, &user, &cid).await;
    assert_eq!(jobs.len(), 2);
    let repair = jobs.iter().find(|j| j.id != first).unwrap();
    let repair = wait_for_final(&harness.scheduler, &repair.id).await.unwrap();
    assert_eq!(repair.status, JobStatus::Success, "failed with {}", repair.err_cause);

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    let proposals = &info.cold.filecoin.proposals;
    assert_eq!(proposals.len(), 1);
    assert_ne!(proposals[0].proposal_cid, slashed);

    harness.scheduler.evaluate_repairs().await;
    assert_eq!(jobs_for(&harness.scheduler, &user, &cid).await.len(), 2);
    harness.close().await;
}

#[tokio::test]
async fn expiring_deal_is_renewed() {
    let lotus = FakeLotus::new(1000);
    lotus.add_miner("m1", 100, Some(10), DealBehavior::Activate);
    let harness = Harness::start(memory_datastore(), lotus, FixedSelector::new(&[("m1", 10)]))
        .await
        .unwrap();
    let user = UserId::from("u1");
    let cid = harness.ipfs.put_block(b"long lived");

    let first = harness
        .scheduler
        .push_storage_config(
            &user,
            &cid,
            StorageConfig::default().with_renew(true, 1_000),
            PushOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        wait_for_final(&harness.scheduler, &first).await.unwrap().status,
        JobStatus::Success
    );
    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    let expiring = info.cold.filecoin.proposals[0].clone();

    harness.scheduler.evaluate_renewals().await;
    assert_eq!(jobs_for(&harness.scheduler, &user, &cid).await.len(), 1);

    let renewal_height = expiring.expiration_epoch() - 100;
    harness.lotus.set_height(renewal_height);
    harness.scheduler.evaluate_renewals().await;
    let jobs = jobs_for(&harness.scheduler, &user, &cid).await;
    assert_eq!(jobs.len(), 2);
    let renewal = jobs.iter().find(|j| j.id != first).unwrap();
    let renewal = wait_for_final(&harness.scheduler, &renewal.id).await.unwrap();
    assert_eq!(renewal.status, JobStatus::Success, "failed with {}", renewal.err_cause);
    assert_eq!(harness.lotus.started_deals().len(), 2);

    let info = harness.scheduler.get_cid_info(&user, &cid).await.unwrap();
    let proposals = &info.cold.filecoin.proposals;
    assert_eq!(proposals.len(), 2);
    let old = proposals
        .iter()
        .find(|p| p.proposal_cid == expiring.proposal_cid)
        .unwrap();
    assert!(old.renewed);
    let fresh = proposals
        .iter()
        .find(|p| p.proposal_cid != expiring.proposal_cid)
        .unwrap();
    assert!(!fresh.renewed);
    assert_eq!(fresh.miner, "m1");
    assert_eq!(fresh.start_epoch, renewal_height);
    harness.close().await;
}
