// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Progress events emitted during a build. */

use {crate::error::Phase, std::sync::Arc};

/// Something that happened during a build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildEvent {
    PhaseStarted(Phase),
    PhaseFinished(Phase),
    PhaseSkipped(Phase),
    /// The fetcher resolved how many assets it will retrieve.
    FetchPlanned { assets: usize },
    /// An asset is available locally.
    AssetFetched {
        name: String,
        size: u64,
        from_cache: bool,
    },
    /// The publisher resolved how many files it will upload.
    UploadPlanned { files: usize, bytes: u64 },
    FileUploaded { path: String, size: u64 },
    FileDeleted { path: String },
}

/// Receives [BuildEvent]s.
pub type EventCallback = Arc<dyn Fn(BuildEvent) + Send + Sync>;

/// An optional [EventCallback].
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Option<EventCallback>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl EventSink {
    pub fn new(callback: EventCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn emit(&self, event: BuildEvent) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}
