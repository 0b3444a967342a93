// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ranged, batched and checkpointed traversal of the chain.

pub mod config;
pub mod coordinator;
pub mod manager;
pub mod retry;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::{db::DbError, rpc::RpcError};

pub use config::{ScanConfig, ScanProfile, ScanType};
pub use coordinator::{ScanCoordinator, ScanSummary};
pub use manager::ScanManager;
pub use retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan {0} is already running")]
    AlreadyRunning(String),

    #[error("Scan {0} is not running")]
    NotRunning(String),

    #[error("Invalid scan config: {0}")]
    InvalidConfig(String),

    #[error("Invalid block range {from}-{to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("Error rate exceeded: {errors} of {blocks} blocks failed")]
    ErrorRateExceeded { errors: u64, blocks: u64 },

    #[error("Lost the advancing lock for scan {0}")]
    LockLost(String),

    #[error("Scan task failed: {0}")]
    TaskFailed(String),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

/// Coordinator lifecycle. `Stopped` is reachable from any active state on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanState {
    Idle,
    RangeDetermined,
    Scanning,
    Checkpointing,
    Complete,
    Errored,
    Stopped,
}

impl ScanState {
    pub fn is_active(&self) -> bool {
        matches!(self, ScanState::RangeDetermined | ScanState::Scanning | ScanState::Checkpointing)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::RangeDetermined => "range-determined",
            ScanState::Scanning => "scanning",
            ScanState::Checkpointing => "checkpointing",
            ScanState::Complete => "complete",
            ScanState::Errored => "errored",
            ScanState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Caller-visible progress of a scan type. Counters are cumulative across runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStatus {
    pub scan_type: String,
    pub state: ScanState,
    pub is_running: bool,
    pub range: Option<(u64, u64)>,
    pub last_scanned_block: Option<u64>,
    pub current_height: Option<u64>,
    pub blocks_scanned: u64,
    pub events_found: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    /// Unix seconds
    pub estimated_completion: Option<i64>,
}

impl ScanStatus {
    pub fn idle(scan_type: &ScanType) -> Self {
        Self {
            scan_type: scan_type.key(),
            state: ScanState::Idle,
            is_running: false,
            range: None,
            last_scanned_block: None,
            current_height: None,
            blocks_scanned: 0,
            events_found: 0,
            errors: 0,
            last_error: None,
            estimated_completion: None,
        }
    }
}
