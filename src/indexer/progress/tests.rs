use super::*;

fn event(status: ProgressStatus, files_done: usize) -> ProgressEvent {
    ProgressEvent {
        subproject: "demo".to_string(),
        status,
        files_done,
        files_total: 3,
        chunks_total: files_done * 2,
        repo: None,
        error: None,
    }
}

#[tokio::test]
async fn late_subscriber_replays_everything() {
    let stream = ProgressStream::default();
    stream.publish(event(ProgressStatus::Scanning, 0));
    stream.publish(event(ProgressStatus::Indexing, 1));

    let mut receiver = stream.subscribe();
    stream.publish(event(ProgressStatus::Indexing, 2));
    stream.publish(event(ProgressStatus::Indexed, 3));

    let mut seen = Vec::new();
    while let Some(event) = receiver.recv().await {
        seen.push((event.status, event.files_done));
    }

    assert_eq!(
        seen,
        vec![
            (ProgressStatus::Scanning, 0),
            (ProgressStatus::Indexing, 1),
            (ProgressStatus::Indexing, 2),
            (ProgressStatus::Indexed, 3),
        ]
    );
}

#[tokio::test]
async fn subscribers_are_independent() {
    let stream = ProgressStream::default();
    let mut first = stream.subscribe();
    stream.publish(event(ProgressStatus::Scanning, 0));
    drop(first.recv().await);
    drop(first);

    stream.publish(event(ProgressStatus::Error, 0));
    let mut second = stream.subscribe();

    assert_eq!(
        second.recv().await.map(|e| e.status),
        Some(ProgressStatus::Scanning)
    );
    assert_eq!(
        second.recv().await.map(|e| e.status),
        Some(ProgressStatus::Error)
    );
    assert!(second.recv().await.is_none());
}

#[test]
fn hub_tracks_latest_run_per_subproject() {
    let hub = ProgressHub::default();
    assert!(hub.subscribe("demo").is_none());

    let old = hub.start_run("demo");
    old.publish(event(ProgressStatus::Indexed, 3));
    let fresh = hub.start_run("demo");
    fresh.publish(event(ProgressStatus::Scanning, 0));

    assert_eq!(
        hub.latest("demo").map(|e| e.status),
        Some(ProgressStatus::Scanning)
    );
    assert!(hub.latest("other").is_none());
}

#[test]
fn events_serialize_with_lowercase_status() {
    let json = serde_json::to_string(&event(ProgressStatus::Indexing, 1)).expect("serializes");
    assert!(json.contains("\"status\":\"indexing\""));
    assert!(!json.contains("\"error\""));
}
