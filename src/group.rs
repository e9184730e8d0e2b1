//! Parser factory and recycling pool.
//!
//! A [`ParserGroup`] owns the four hooks shared by every parser it hands
//! out and a capped free list of released parser cores. The group may be
//! shared across threads; each parser it produces is single-owner. Dropping
//! a parser returns its core to the free list (up to [`MAX_POOL`] cores are
//! retained) so a busy acceptor loop stops allocating once warm.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::parser::{ParserCore, RequestParser};

/// Upper bound on recyclable parser cores per group.
pub const MAX_POOL: usize = 256;

/// Hook fired at a protocol boundary that carries no body bytes.
pub type EventHook = Arc<dyn Fn(&mut RequestParser) + Send + Sync>;

/// Hook fired with an optional view of body bytes. The view is only
/// guaranteed for the duration of the call; clone it to keep it.
pub type BodyHook = Arc<dyn Fn(&mut RequestParser, Option<&Bytes>) + Send + Sync>;

/// The callbacks shared by every parser of a group.
///
/// `on_headers`, `on_request_end` and `on_parsing_error` are required;
/// [`ParserHooks::on_body_chunk`] optionally adds per-chunk delivery for
/// chunked bodies. Without it, chunk payloads accumulate inside the parser
/// and arrive concatenated at `on_request_end`.
pub struct ParserHooks {
    pub(crate) on_headers: EventHook,
    pub(crate) on_body_chunk: Option<BodyHook>,
    pub(crate) on_request_end: BodyHook,
    pub(crate) on_parsing_error: EventHook,
}

impl ParserHooks {
    pub fn new<H, E, P>(on_headers: H, on_request_end: E, on_parsing_error: P) -> Self
    where
        H: Fn(&mut RequestParser) + Send + Sync + 'static,
        E: Fn(&mut RequestParser, Option<&Bytes>) + Send + Sync + 'static,
        P: Fn(&mut RequestParser) + Send + Sync + 'static,
    {
        Self {
            on_headers: Arc::new(on_headers),
            on_body_chunk: None,
            on_request_end: Arc::new(on_request_end),
            on_parsing_error: Arc::new(on_parsing_error),
        }
    }

    /// Registers the per-chunk hook.
    pub fn on_body_chunk<C>(mut self, hook: C) -> Self
    where
        C: Fn(&mut RequestParser, Option<&Bytes>) + Send + Sync + 'static,
    {
        self.on_body_chunk = Some(Arc::new(hook));
        self
    }
}

pub(crate) struct GroupShared {
    pub(crate) hooks: ParserHooks,
    pool: Mutex<PoolState>,
    released: Condvar,
}

struct PoolState {
    free: Vec<Box<ParserCore>>,
    /// Pool-member cores handed out over the group's lifetime.
    members: usize,
}

impl GroupShared {
    /// Takes a finished core back. Pool members are scrubbed and pushed on
    /// the free list; cores built past the cap are dropped.
    pub(crate) fn recycle(&self, mut core: Box<ParserCore>) {
        if core.is_pool_member() {
            core.reset();
            let mut pool = self.pool.lock();
            pool.free.push(core);
            self.released.notify_all();
        }
    }
}

/// Hands out [`RequestParser`]s sharing one set of hooks.
pub struct ParserGroup {
    shared: Arc<GroupShared>,
}

impl ParserGroup {
    pub fn new(hooks: ParserHooks) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                hooks,
                pool: Mutex::new(PoolState { free: Vec::new(), members: 0 }),
                released: Condvar::new(),
            }),
        }
    }

    /// Produces a parser armed for a new request, recycling a pooled core
    /// when one is free.
    pub fn acquire(&self) -> RequestParser {
        let mut pool = self.shared.pool.lock();
        let core = if let Some(mut core) = pool.free.pop() {
            drop(pool);
            core.arm();
            core
        } else {
            let pool_member = pool.members < MAX_POOL;
            if pool_member {
                pool.members += 1;
            }
            drop(pool);
            ParserCore::new(pool_member)
        };
        RequestParser::assemble(core, Arc::clone(&self.shared))
    }

    /// Tears the group down, blocking until every pool-member parser has
    /// been released back, then drops the retained cores.
    pub fn destroy(self) {
        let mut pool = self.shared.pool.lock();
        while pool.free.len() < pool.members {
            self.shared.released.wait(&mut pool);
        }
        let drained = pool.free.len();
        pool.free.clear();
        pool.members = 0;
        debug!(drained, "parser group drained");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn noop_hooks() -> ParserHooks {
        ParserHooks::new(
            |_: &mut RequestParser| {},
            |_: &mut RequestParser, _: Option<&Bytes>| {},
            |_: &mut RequestParser| {},
        )
    }

    fn free_len(group: &ParserGroup) -> usize {
        group.shared.pool.lock().free.len()
    }

    fn members(group: &ParserGroup) -> usize {
        group.shared.pool.lock().members
    }

    #[test]
    fn release_recycles_the_core() {
        let group = ParserGroup::new(noop_hooks());

        let mut parser = group.acquire();
        parser.parse(b"GET /one HTTP/1.1\r\n\r\n");
        assert!(parser.is_complete());
        parser.release();

        assert_eq!(free_len(&group), 1);
        assert_eq!(members(&group), 1);

        // the recycled core serves a fresh request
        let mut parser = group.acquire();
        assert_eq!(free_len(&group), 0);
        assert_eq!(parser.method(), None);
        parser.parse(b"GET /two HTTP/1.1\r\n\r\n");
        assert_eq!(parser.uri(), Some("/two"));
        assert_eq!(members(&group), 1);
    }

    #[test]
    fn pool_membership_is_capped() {
        let group = ParserGroup::new(noop_hooks());

        let parsers: Vec<RequestParser> = (0..MAX_POOL + 10).map(|_| group.acquire()).collect();
        assert_eq!(members(&group), MAX_POOL);

        drop(parsers);
        assert_eq!(free_len(&group), MAX_POOL);

        // recycled cores are preferred over fresh ones
        let _parser = group.acquire();
        assert_eq!(free_len(&group), MAX_POOL - 1);
        assert_eq!(members(&group), MAX_POOL);
    }

    #[test]
    fn hooks_are_shared_across_parsers() {
        let ends = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ends);
        let group = ParserGroup::new(ParserHooks::new(
            |_: &mut RequestParser| {},
            move |_: &mut RequestParser, _: Option<&Bytes>| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_: &mut RequestParser| {},
        ));

        for _ in 0..3 {
            let mut parser = group.acquire();
            parser.parse(b"GET / HTTP/1.1\r\n\r\n");
        }
        assert_eq!(ends.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn destroy_waits_for_outstanding_parsers() {
        let group = ParserGroup::new(noop_hooks());
        let parser = group.acquire();

        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            drop(parser);
        });

        group.destroy();
        assert!(released.load(Ordering::SeqCst));
        handle.join().unwrap();
    }

    #[test]
    fn parsers_move_between_threads() {
        let group = ParserGroup::new(noop_hooks());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let mut parser = group.acquire();
                std::thread::spawn(move || {
                    let request = format!("GET /t{i} HTTP/1.1\r\nHost: x\r\n\r\n");
                    parser.parse(request.as_bytes());
                    assert_eq!(parser.uri(), Some(format!("/t{i}").as_str()));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(free_len(&group), 4);
    }
}
