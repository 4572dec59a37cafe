use chatify_core::candidates::{CandidateQueue, Routed};
use chatify_core::signaling::{SignalKind, SignalRow, SignalingMessage};
use chatify_core::types::{CallMode, UserId};

/// A change notification as delivered by the realtime backend for an insert
/// into the `calls` table.
const OFFER_NOTIFICATION: &str = r#"{
    "caller_id": "7f1c",
    "receiver_id": "a902",
    "type": "offer",
    "signal_data": "{\"sdp\":{\"type\":\"offer\",\"sdp\":\"v=0\\r\\no=- 46117 2 IN IP4 127.0.0.1\\r\\n\"}}",
    "call_mode": "video",
    "created_at": "2026-03-01T10:15:00Z"
}"#;

#[test]
fn parses_change_notification_row() {
    let row: SignalRow = serde_json::from_str(OFFER_NOTIFICATION).expect("row should parse");
    let msg = SignalingMessage::from_row(&row).expect("message should parse");

    assert_eq!(msg.kind, SignalKind::Offer);
    assert_eq!(msg.from_id, UserId::from("7f1c"));
    assert_eq!(msg.to_id, UserId::from("a902"));
    assert_eq!(msg.mode, Some(CallMode::Video));
    assert!(msg.description().unwrap().sdp.starts_with("v=0\r\n"));
}

#[test]
fn end_row_without_mode_or_timestamp() {
    let row: SignalRow = serde_json::from_str(
        r#"{"caller_id":"7f1c","receiver_id":"a902","type":"end","signal_data":"{}"}"#,
    )
    .expect("row should parse");
    let msg = SignalingMessage::from_row(&row).expect("message should parse");

    assert_eq!(msg.kind, SignalKind::End);
    assert_eq!(msg.mode, None);
}

#[test]
fn reordered_candidates_reach_queue_in_sender_order() {
    let from = UserId::from("7f1c");
    let to = UserId::from("a902");

    let rows: Vec<SignalRow> = (0..3)
        .map(|i| {
            SignalingMessage::candidate(
                from.clone(),
                to.clone(),
                CallMode::Audio,
                chatify_core::signaling::IceCandidate::new(format!("candidate:{i}"))
                    .with_sdp_mid("0")
                    .with_sdp_m_line_index(0),
            )
            .to_row()
            .expect("encode")
        })
        .collect();

    let mut queue = CandidateQueue::new();
    for row in &rows {
        let msg = SignalingMessage::from_row(row).expect("decode");
        let cand = msg.ice_candidate().cloned().expect("candidate payload");
        assert_eq!(queue.push(cand), Routed::Queued);
    }

    let drained: Vec<String> = queue.drain().into_iter().map(|c| c.candidate).collect();
    assert_eq!(drained, vec!["candidate:0", "candidate:1", "candidate:2"]);
}
