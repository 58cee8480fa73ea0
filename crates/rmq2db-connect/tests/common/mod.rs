#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rmq2db_connect::{
    Acknowledger, Bridge, BridgeError, FlushSettings, HandlerDescriptor, HandlerRegistry,
    InboundMessage, TransactionalWriter,
};
use rmq2db_rdbc::connection::ConnectionConfig;
use rmq2db_rdbc::sink::{build_sink, SinkTarget, WriteStrategy, DEFAULT_PAGE_SIZE};
use rmq2db_rdbc::testing::{MockConnection, MockConnectionFactory};
use std::sync::Arc;
use std::time::Duration;

/// 2024-01-01 12:00:00 UTC
pub const T1: i64 = 1_704_110_400;
pub const T1_TEXT: &str = "2024-01-01 12:00:00.000000+00";

/// Records cumulative acks; can be told to fail
#[derive(Default)]
pub struct RecordingAcker {
    acked: Mutex<Vec<u64>>,
    failures: Mutex<usize>,
}

impl RecordingAcker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    pub fn fail_next(&self, times: usize) {
        *self.failures.lock() = times;
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack_up_to(&self, delivery_tag: u64) -> rmq2db_connect::Result<()> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(BridgeError::Ack("channel closed".into()));
        }
        self.acked.lock().push(delivery_tag);
        Ok(())
    }
}

pub struct Harness {
    pub bridge: Arc<Bridge>,
    pub factory: MockConnectionFactory,
    pub conn: MockConnection,
    pub acker: Arc<RecordingAcker>,
    next_tag: Mutex<u64>,
}

impl Harness {
    /// roomtemp (bulk merge on time, room_id) and doors (plain copy)
    pub fn new(settings: FlushSettings) -> Self {
        Self::with_strategy(WriteStrategy::BulkMerge, settings)
    }

    pub fn with_strategy(roomtemp_strategy: WriteStrategy, settings: FlushSettings) -> Self {
        let registry = registry(roomtemp_strategy);
        let conn = MockConnection::new();
        let factory = MockConnectionFactory::new(conn.clone());
        let writer = TransactionalWriter::new(
            Arc::new(factory.clone()),
            ConnectionConfig::new("postgres://mock/iot"),
        );

        Self {
            bridge: Arc::new(Bridge::new(Arc::new(registry), writer, settings)),
            factory,
            conn,
            acker: RecordingAcker::new(),
            next_tag: Mutex::new(0),
        }
    }

    pub fn message(&self, routing_key: &str, body: &str) -> InboundMessage {
        let tag = {
            let mut next = self.next_tag.lock();
            *next += 1;
            *next
        };
        let acker: Arc<dyn Acknowledger> = self.acker.clone();
        InboundMessage::new(routing_key, body.to_string(), tag, acker)
    }

    pub fn reading(&self, room: &str, temp: f64) -> InboundMessage {
        self.message("sensors.roomtemp.json", &reading_body(room, temp))
    }

    pub fn door(&self, door: &str, open: bool) -> InboundMessage {
        self.message("sensors.doors.json", &door_body(door, open))
    }

    /// COPY payloads of committed transactions, in order
    pub fn committed_copies(&self) -> Vec<String> {
        self.conn
            .committed_statements()
            .iter()
            .filter_map(|s| s.copy_text())
            .collect()
    }
}

/// roomtemp keyed on (time, room_id) with `roomtemp_strategy`, doors as plain copy
pub fn registry(roomtemp_strategy: WriteStrategy) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    let roomtemp = SinkTarget::new(
        "roomtemp",
        vec!["time".into(), "room_id".into()],
        vec!["temp".into()],
    );
    let sink = build_sink(roomtemp_strategy, roomtemp, DEFAULT_PAGE_SIZE).unwrap();
    registry
        .register(HandlerDescriptor::new("roomtemp", sink))
        .unwrap();

    let doors = SinkTarget::new("doors", vec![], vec!["door".into(), "open".into()]);
    let sink = build_sink(WriteStrategy::Copy, doors, DEFAULT_PAGE_SIZE).unwrap();
    registry.register(HandlerDescriptor::new("doors", sink)).unwrap();

    registry
}

pub fn reading_body(room: &str, temp: f64) -> String {
    format!(r#"{{"time": {}, "room_id": "{}", "temp": {:?}}}"#, T1, room, temp)
}

pub fn door_body(door: &str, open: bool) -> String {
    format!(r#"{{"door": "{}", "open": {}}}"#, door, open)
}

pub fn settings(count: usize, max_wait: Duration) -> FlushSettings {
    FlushSettings {
        count,
        max_wait,
        retry_backoff: max_wait,
    }
}
