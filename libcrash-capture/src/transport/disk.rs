// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Envelope, Transport};
use crate::run::Run;
use tracing::debug;

/// Writes every envelope straight into the run directory. Used once the
/// process has crashed and nothing can be sent over the network anymore.
#[derive(Debug, Clone)]
pub struct DiskTransport {
    run: Run,
}

impl DiskTransport {
    pub fn new(run: Run) -> Self {
        Self { run }
    }
}

impl Transport for DiskTransport {
    fn send_envelope(&self, envelope: Envelope) {
        if let Err(e) = self.run.write_envelope(&envelope) {
            if !crate::sync::in_signal_handler() {
                debug!(error = %e, "Failed to write envelope {} to disk", envelope.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_into_run() -> anyhow::Result<()> {
        let db = tempfile::tempdir()?;
        let run = Run::new(db.path())?;
        let transport = DiskTransport::new(run.clone());
        let envelope = Envelope::from_event(&crate::new_event())?;
        transport.send_envelope(envelope.clone());
        assert_eq!(vec![envelope], run.envelopes()?);
        // Nothing is ever queued.
        assert_eq!(0, transport.dump_queue(&run));
        Ok(())
    }
}
