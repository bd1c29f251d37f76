// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Unix signal processing

use log::{error, warn};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::{self, JoinHandle};

use crate::writer::RotatingFile;

fn listen_to_signal(kind: SignalKind, file: Arc<RotatingFile>) -> Option<JoinHandle<()>> {
    let mut sig = match signal(kind) {
        Ok(sig) => sig,
        Err(err) => {
            warn!(
                "Failed registering for signal {}: {err}",
                kind.as_raw_value()
            );
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while sig.recv().await.is_some() {
            let file = file.clone();
            match task::spawn_blocking(move || file.reopen()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Failed re-opening log file: {err}"),
                Err(err) => error!("Failed re-opening log file, task crashed? {err}"),
            }
        }
    }))
}

/// Makes `HUP` and `USR1` signals re-open the log file. The returned tasks run until aborted.
pub(crate) fn listen(file: &Arc<RotatingFile>) -> Vec<JoinHandle<()>> {
    [SignalKind::hangup(), SignalKind::user_defined1()]
        .into_iter()
        .filter_map(|kind| listen_to_signal(kind, file.clone()))
        .collect()
}
