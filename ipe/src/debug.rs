// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Shared debug-data service.
//!
//! Nodes in the same process share one writer.  The writer is created when the first node
//! acquires it and destroyed when the last one releases it.

use super::iq::ModuleMask;
use super::types::RequestId;
use log::debug;
use std::sync::{Arc, Mutex};

/// What a request programmed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DebugRecord {
    /// The request id.
    pub request_id: RequestId,
    /// The modules that were programmed.
    pub modules: ModuleMask,
    /// Number of non-skip CDM programs.
    pub programs: usize,
    /// Number of patch descriptors.
    pub patches: usize,
}

/// The contents of a failed request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DebugDump {
    /// The request id.
    pub request_id: RequestId,
    /// The frame-process buffer.
    pub frame_process: Vec<u8>,
    /// The IQ settings buffer.
    pub iq_settings: Vec<u8>,
}

/// Collects debug data.
#[derive(Debug, Default)]
pub struct DebugDataWriter {
    records: Mutex<Vec<DebugRecord>>,
    dumps: Mutex<Vec<DebugDump>>,
}

impl DebugDataWriter {
    /// Records the programming summary of a request.
    pub fn record(&self, record: DebugRecord) {
        self.records.lock().unwrap().push(record);
    }

    /// Stores the dump of a failed request.
    pub fn dump(&self, dump: DebugDump) {
        debug!(
            "dumping request {} ({} bytes)",
            dump.request_id,
            dump.frame_process.len() + dump.iq_settings.len()
        );
        self.dumps.lock().unwrap().push(dump);
    }

    /// Returns every record so far.
    pub fn records(&self) -> Vec<DebugRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Returns every dump so far.
    pub fn dumps(&self) -> Vec<DebugDump> {
        self.dumps.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    refs: usize,
    writer: Option<Arc<DebugDataWriter>>,
}

/// A reference-counted owner of the shared [`DebugDataWriter`].
#[derive(Debug, Default)]
pub struct DebugDataService {
    state: Mutex<ServiceState>,
}

impl DebugDataService {
    /// Creates a service with no writer.
    pub fn create() -> Arc<Self> {
        Arc::new(Default::default())
    }

    /// Takes a reference to the writer, creating it on first use.
    pub fn acquire(&self) -> Arc<DebugDataWriter> {
        let mut state = self.state.lock().unwrap();
        state.refs += 1;

        match &state.writer {
            Some(writer) => writer.clone(),
            None => {
                debug!("creating debug-data writer");
                let writer = Arc::new(DebugDataWriter::default());
                state.writer = Some(writer.clone());
                writer
            }
        }
    }

    /// Drops a reference.  The writer is destroyed with the last one.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if state.refs == 0 {
            return;
        }

        state.refs -= 1;
        if state.refs == 0 {
            debug!("destroying debug-data writer");
            state.writer = None;
        }
    }

    /// Returns the number of live references.
    pub fn refs(&self) -> usize {
        self.state.lock().unwrap().refs
    }

    /// Returns the writer if it exists.
    pub fn writer(&self) -> Option<Arc<DebugDataWriter>> {
        self.state.lock().unwrap().writer.clone()
    }
}
