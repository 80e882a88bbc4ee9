use crd_delta::Mutation;
use crd_dispatch::{LocalBus, MessageBus, SyncService};
use crd_model::{ResourceKind, ResyncRequest, Row, SyncComplete, VersionId, SERVER_TOPIC};
use crd_test_utils::{collect, seeded_store};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn request(bus: &LocalBus, host: &str, since: Option<VersionId>) {
    let body = ResyncRequest {
        host: host.to_string(),
        since,
    }
    .into_message()
    .unwrap()
    .to_bytes()
    .unwrap();
    bus.publish(SERVER_TOPIC, body).await.unwrap();
}

async fn wait_for_server(bus: &LocalBus) {
    while bus.subscriber_count(SERVER_TOPIC) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn resync_request_streams_ordered_snapshot() {
    let bus = Arc::new(LocalBus::new());
    let service = Arc::new(SyncService::new(seeded_store().await, bus.clone()));
    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let service = service.clone();
        let cancel = cancel.clone();
        async move { service.serve(cancel).await }
    });
    wait_for_server(&bus).await;

    let mut relay = bus.subscribe("crd_relay_agent.compute-1").await.unwrap();
    request(&bus, "compute-1", None).await;

    let messages = collect(&mut relay, ResourceKind::ALL.len(), WAIT).await;
    let methods: Vec<&str> = messages.iter().map(|m| m.method.as_str()).collect();
    assert_eq!(
        methods,
        vec![
            "create_chain",
            "create_service",
            "create_chain_set",
            "create_bypass_rule",
            "create_chain_service",
            "create_selection_rule",
            "create_network_map",
            "create_appliance_instance",
        ]
    );
    let versions: Vec<u64> = messages
        .iter()
        .map(|m| m.version_id().unwrap().get())
        .collect();
    assert_eq!(versions, (1..=8).collect::<Vec<_>>());

    let trailer = collect(&mut relay, 1, WAIT).await;
    assert_eq!(
        SyncComplete::from_message(&trailer[0]).unwrap(),
        Some(SyncComplete {
            version_id: VersionId(8)
        })
    );

    cancel.cancel();
    server.await.unwrap();
}

#[tokio::test]
async fn live_mutation_follows_resync() {
    let bus = Arc::new(LocalBus::new());
    let service = SyncService::new(seeded_store().await, bus.clone());
    let mut relay = bus.subscribe("crd_relay_agent.compute-2").await.unwrap();
    let mut consumers = bus.subscribe("crd_consumer").await.unwrap();

    let report = service.resync("compute-2", None).await.unwrap();
    assert_eq!(report.messages, ResourceKind::ALL.len());
    // rows plus the sync_complete trailer
    collect(&mut relay, report.messages + 1, WAIT).await;

    let outcome = service
        .mutate(Mutation::create(
            ResourceKind::ApplianceInstance,
            Row::new("I2").with_attr("appliance_map_id", "M1"),
        ))
        .await
        .unwrap();
    assert_eq!(outcome.delivered, 1);

    let live = collect(&mut relay, 1, WAIT).await;
    assert_eq!(live[0].method, "create_appliance_instance");
    assert_eq!(live[0].field_str("chain_id"), Some("C1"));
    assert_eq!(live[0].version_id(), Some(VersionId(9)));

    let notified = collect(&mut consumers, 1, WAIT).await;
    assert_eq!(notified[0], live[0]);
}

#[tokio::test]
async fn incremental_resync_sends_only_the_tail() {
    let bus = Arc::new(LocalBus::new());
    let service = SyncService::new(seeded_store().await, bus.clone());
    service
        .mutate(Mutation::delete(ResourceKind::ApplianceInstance, "I1"))
        .await
        .unwrap();

    let mut relay = bus.subscribe("crd_relay_agent.compute-3").await.unwrap();
    let report = service
        .resync("compute-3", Some(VersionId(8)))
        .await
        .unwrap();
    assert!(report.incremental);
    assert_eq!(report.messages, 1);
    assert_eq!(report.high_water, Some(VersionId(9)));

    let tail = collect(&mut relay, 2, WAIT).await;
    assert_eq!(tail[0].method, "delete_appliance_instance");
    assert_eq!(tail[1].method, SyncComplete::METHOD);
    assert_eq!(tail[1].version_id(), Some(VersionId(9)));
}

#[tokio::test(start_paused = true)]
async fn server_resubscribes_after_broker_drop() {
    let bus = Arc::new(LocalBus::new());
    let service = Arc::new(
        SyncService::new(seeded_store().await, bus.clone())
            .with_retry_interval(Duration::from_secs(2)),
    );
    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let service = service.clone();
        let cancel = cancel.clone();
        async move { service.serve(cancel).await }
    });
    wait_for_server(&bus).await;

    bus.sever();
    assert_eq!(bus.subscriber_count(SERVER_TOPIC), 0);
    wait_for_server(&bus).await;

    let mut relay = bus.subscribe("crd_relay_agent.compute-4").await.unwrap();
    request(&bus, "compute-4", None).await;
    let messages = collect(&mut relay, ResourceKind::ALL.len(), WAIT).await;
    assert_eq!(messages.len(), ResourceKind::ALL.len());
    assert_eq!(service.hosts(), vec!["compute-4".to_string()]);

    cancel.cancel();
    server.await.unwrap();
}
