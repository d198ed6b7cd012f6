use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

use crate::partition::Partition;

/// OTel counters for the queue engine. Created once per engine and shared by
/// the ownership guard and the DLQ controller.
pub struct Metrics {
    pub rows_inserted: Counter<u64>,
    pub rows_deleted: Counter<u64>,
    pub duplicate_inserts: Counter<u64>,
    pub fenced_out_writes: Counter<u64>,
    pub partitions_acquired: Counter<u64>,
    pub dlq_appended: Counter<u64>,
    pub dlq_merged: Counter<u64>,
    pub dlq_purged: Counter<u64>,
    pub dlq_merge_failures: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn queue_attr(partition: &Partition) -> [KeyValue; 1] {
    [KeyValue::new("queue", partition.to_string())]
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured, the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("coda");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            rows_inserted: meter
                .u64_counter("coda.rows.inserted")
                .with_description("Rows written by fenced inserts")
                .build(),
            rows_deleted: meter
                .u64_counter("coda.rows.deleted")
                .with_description("Rows removed by point, range and threshold deletes")
                .build(),
            duplicate_inserts: meter
                .u64_counter("coda.rows.duplicate_inserts")
                .with_description("Insert batches rejected for a duplicate key")
                .build(),
            fenced_out_writes: meter
                .u64_counter("coda.ownership.fenced_out")
                .with_description("Writes rejected because the ownership token was stale")
                .build(),
            partitions_acquired: meter
                .u64_counter("coda.ownership.acquired")
                .with_description("Successful partition ownership acquisitions")
                .build(),
            dlq_appended: meter
                .u64_counter("coda.dlq.appended")
                .with_description("Messages appended to a dead-letter partition")
                .build(),
            dlq_merged: meter
                .u64_counter("coda.dlq.merged")
                .with_description("Dead-letter messages applied and removed by merge")
                .build(),
            dlq_purged: meter
                .u64_counter("coda.dlq.purged")
                .with_description("Dead-letter messages removed by purge")
                .build(),
            dlq_merge_failures: meter
                .u64_counter("coda.dlq.merge_failures")
                .with_description("Merges that stopped before the end of their range")
                .build(),
        }
    }

    pub fn record_inserted(&self, partition: &Partition, count: u64) {
        self.rows_inserted.add(count, &queue_attr(partition));
    }

    pub fn record_deleted(&self, partition: &Partition, count: u64) {
        self.rows_deleted.add(count, &queue_attr(partition));
    }

    pub fn record_duplicate(&self, partition: &Partition) {
        self.duplicate_inserts.add(1, &queue_attr(partition));
    }

    pub fn record_fenced_out(&self, partition: &Partition) {
        self.fenced_out_writes.add(1, &queue_attr(partition));
    }

    pub fn record_acquired(&self, partition: &Partition) {
        self.partitions_acquired.add(1, &queue_attr(partition));
    }

    pub fn record_dlq_appended(&self, partition: &Partition) {
        self.dlq_appended.add(1, &queue_attr(partition));
    }

    pub fn record_dlq_merged(&self, partition: &Partition, count: u64) {
        self.dlq_merged.add(count, &queue_attr(partition));
    }

    pub fn record_dlq_purged(&self, partition: &Partition, count: u64) {
        self.dlq_purged.add(count, &queue_attr(partition));
    }

    pub fn record_dlq_merge_failure(&self, partition: &Partition) {
        self.dlq_merge_failures.add(1, &queue_attr(partition));
    }
}
