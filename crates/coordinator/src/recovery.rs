//! Recovery after a restart
//!
//! Every decision in the log without a completion is driven again: the
//! transaction is rebuilt with its participants prepared, the decision is
//! re-sent to each of them and the original caller, if it is still around,
//! gets its reply once all of them have answered. Participants treat a
//! repeated commit or rollback of the same xid as a no-op.

use crate::coordinator::Coordinator;
use crate::correlation::ReplyTo;
use crate::error::Result;
use crate::transaction::Stage;
use std::time::Instant;
use tmx_common::{Flags, Outcome};
use tmx_journal::{Decision, DecisionRecord, Journal};
use tmx_protocol::{Phase, RequestKind};
use tmx_transport::Transport;

impl<T: Transport, J: Journal> Coordinator<T, J> {
    pub fn recover(&mut self) -> Result<usize> {
        self.recover_at(Instant::now())
    }

    /// Re-drive outstanding decisions. Transactions already known are
    /// skipped, so running this twice sends nothing new. Returns the number
    /// of transactions taken up.
    pub fn recover_at(&mut self, now: Instant) -> Result<usize> {
        let records = self.journal.outstanding()?;
        let mut recovered = 0;

        for record in records {
            if self.transactions.contains(&record.xid) {
                tracing::debug!("[{}] already in progress, not recovering", record.xid);
                continue;
            }
            self.resume(record, now)?;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!("recovered {} transactions from the log", recovered);
        }
        Ok(recovered)
    }

    fn resume(&mut self, record: DecisionRecord, now: Instant) -> Result<()> {
        let DecisionRecord {
            xid,
            decision,
            outcome,
            participants,
            caller,
        } = record;

        let phase = match decision {
            Decision::Commit => Phase::Commit,
            Decision::Rollback => Phase::Rollback,
        };
        let owner = caller
            .as_ref()
            .map_or(self.identity, |caller| caller.process);
        let reply = caller.map(|caller| ReplyTo {
            process: caller.process,
            correlation: caller.correlation,
            resource: caller.resource,
            kind: match caller.requested {
                Decision::Commit => RequestKind::Commit,
                Decision::Rollback => RequestKind::Rollback,
            },
        });

        tracing::info!(
            "[{}] recovering {} over {} participants",
            xid,
            phase.as_str(),
            participants.len()
        );

        self.transactions
            .restore(xid, owner, &participants, Stage::PrepareReplied, Outcome::Ok);
        let deadline = self.deadline(now);
        self.correlations
            .resume(xid, reply, phase, &participants, outcome, deadline)?;

        if participants.is_empty() {
            return self.complete(xid, now);
        }

        // The decision is durable already, no need to wait for a flush
        self.fan_out(xid, phase, &participants, Flags::NO_FLAGS, now, false)
    }
}
