//! Bounded worker pool for blocking store calls.
//!
//! The reactor never calls the store itself. It hands a [`Job`] to the
//! pool together with an owned copy of everything the job needs; the
//! result comes back as a [`ReactorEvent`] on the reactor channel.

use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::channel::{JobDone, JobOutcome, ReactorEvent, ReactorSender, SessionId};
use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::LogPackage;
use crate::store::{ClientRecord, Store};

/// Store work requested by a session.
#[derive(Debug)]
pub enum Job {
    Identify {
        request_id: i32,
        identity: Identity,
    },
    QueryLastRecord {
        request_id: i32,
        client: ClientRecord,
    },
    Insert {
        request_id: i32,
        client: ClientRecord,
        package: LogPackage,
    },
}

impl Job {
    pub fn request_id(&self) -> i32 {
        match self {
            Job::Identify { request_id, .. }
            | Job::QueryLastRecord { request_id, .. }
            | Job::Insert { request_id, .. } => *request_id,
        }
    }

    /// Run against the store. Blocking.
    pub fn run(self, store: &dyn Store) -> JobOutcome {
        match self {
            Job::Identify { identity, .. } => {
                JobOutcome::Identified(store.lookup_or_register_client(&identity))
            }
            Job::QueryLastRecord { client, .. } => {
                JobOutcome::LastRecordId(store.last_record_id(&client))
            }
            Job::Insert {
                client, package, ..
            } => JobOutcome::Inserted {
                result: store.insert_events(&client, &package.events),
                need_accept: package.need_accept,
                last_record_id: package.last_record_id(),
            },
        }
    }
}

pub struct WorkerPool {
    pool: ThreadPool,
    store: Arc<dyn Store>,
    events: ReactorSender,
}

impl WorkerPool {
    pub fn new(threads: usize, store: Arc<dyn Store>, events: ReactorSender) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("logship-worker-{}", i))
            .build()?;
        Ok(Self {
            pool,
            store,
            events,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue a job; its [`JobDone`] is delivered to the reactor.
    pub fn submit(&self, session: SessionId, job: Job) {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        self.pool.spawn(move || {
            let request_id = job.request_id();
            let outcome = job.run(store.as_ref());
            let done = JobDone {
                session,
                request_id,
                outcome,
            };
            if events.send(ReactorEvent::JobDone(done)).is_err() {
                tracing::debug!(session, request_id, "reactor gone, dropping job completion");
            }
        });
    }

    /// Re-check store connectivity, reconnecting if needed.
    pub fn check_store(&self) {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        self.pool.spawn(move || {
            let result = if store.is_connected() {
                Ok(())
            } else {
                store.reconnect()
            };
            if events.send(ReactorEvent::StoreChecked(result)).is_err() {
                tracing::debug!("reactor gone, dropping store check result");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::identity::OsKind;
    use crate::protocol::{Event, LogLevel};
    use crate::server::channel::reactor_channel;
    use crate::store::MemoryStore;

    fn identity() -> Identity {
        Identity::new("ws-17", OsKind::Windows, "10.0.22631", "feedface")
    }

    fn events(range: std::ops::RangeInclusive<u64>) -> Vec<Event> {
        range
            .map(|rid| Event {
                xml: "<Event/>".into(),
                format: String::new(),
                timestamp: "2026-10-19T11:00:00Z".into(),
                provider: "EventLog".into(),
                level: LogLevel::Info,
                record_id: rid,
            })
            .collect()
    }

    async fn next_done(rx: &mut crate::server::channel::ReactorReceiver) -> JobDone {
        match rx.recv().await.unwrap() {
            ReactorEvent::JobDone(done) => done,
            other => panic!("Expected JobDone, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_jobs_report_back() {
        let store = Arc::new(MemoryStore::connected());
        let (tx, mut rx) = reactor_channel();
        let pool = WorkerPool::new(2, store.clone(), tx).unwrap();
        assert_eq!(pool.threads(), 2);

        pool.submit(
            7,
            Job::Identify {
                request_id: 100,
                identity: identity(),
            },
        );
        let done = next_done(&mut rx).await;
        assert_eq!((done.session, done.request_id), (7, 100));
        let client = match done.outcome {
            JobOutcome::Identified(Ok(client)) => client,
            other => panic!("Expected Identified, got {:?}", other),
        };

        pool.submit(
            7,
            Job::Insert {
                request_id: 101,
                client: client.clone(),
                package: LogPackage {
                    events: events(1..=41),
                    need_accept: true,
                },
            },
        );
        match next_done(&mut rx).await.outcome {
            JobOutcome::Inserted {
                result,
                need_accept,
                last_record_id,
            } => {
                assert_eq!(result.unwrap(), 41);
                assert!(need_accept);
                assert_eq!(last_record_id, Some(41));
            }
            other => panic!("Expected Inserted, got {:?}", other),
        }

        pool.submit(
            7,
            Job::QueryLastRecord {
                request_id: 102,
                client,
            },
        );
        match next_done(&mut rx).await.outcome {
            JobOutcome::LastRecordId(Ok(last)) => assert_eq!(last, 41),
            other => panic!("Expected LastRecordId, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_check_reconnects() {
        let store = Arc::new(MemoryStore::connected());
        store.set_connected(false);
        let (tx, mut rx) = reactor_channel();
        let pool = WorkerPool::new(1, store.clone(), tx).unwrap();

        pool.check_store();
        match rx.recv().await.unwrap() {
            ReactorEvent::StoreChecked(result) => assert!(result.is_ok()),
            other => panic!("Expected StoreChecked, got {:?}", other),
        }
        assert!(store.is_connected());
    }

    #[tokio::test]
    async fn test_disconnected_store_outcome() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = reactor_channel();
        let pool = WorkerPool::new(1, store, tx).unwrap();

        pool.submit(
            1,
            Job::Identify {
                request_id: 5,
                identity: identity(),
            },
        );
        let done = next_done(&mut rx).await;
        assert!(done.outcome.store_disconnected());
        assert!(matches!(
            done.outcome,
            JobOutcome::Identified(Err(StoreError::Disconnected))
        ));
    }
}
