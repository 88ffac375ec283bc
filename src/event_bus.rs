/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the service and passes them to event handlers.
//!
//! A service's instance of [EventHandlers] contains, per event type, the optional user-defined
//! handler passed at start and, when event logging is enabled, the default logging handler from
//! [logging](crate::logging).

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

/// Pointer to a handler closure, parametrised by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// The optional logging handler and optional user-defined handler of one event type.
pub(crate) struct HandlerPair<T: Logger> {
    user_defined_handler: Option<HandlerPtr<T>>,
    logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    fn handle(&self, event: &T) {
        if let Some(handler) = &self.logging_handler {
            handler(event)
        }
        if let Some(handler) = &self.user_defined_handler {
            handler(event)
        }
    }
}

/// The handlers for every pre-defined event type.
pub struct EventHandlers {
    pub(crate) commit_block: HandlerPair<CommitBlockEvent>,
    pub(crate) propose_block: HandlerPair<ProposeBlockEvent>,
    pub(crate) verify_block: HandlerPair<VerifyBlockEvent>,
    pub(crate) collect_tx: HandlerPair<CollectTxEvent>,
    pub(crate) view_change_start: HandlerPair<ViewChangeStartEvent>,
    pub(crate) view_change_complete: HandlerPair<ViewChangeCompleteEvent>,
    pub(crate) start_catch_up: HandlerPair<StartCatchUpEvent>,
    pub(crate) end_catch_up: HandlerPair<EndCatchUpEvent>,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: bool,
        commit_block: Option<HandlerPtr<CommitBlockEvent>>,
        propose_block: Option<HandlerPtr<ProposeBlockEvent>>,
        verify_block: Option<HandlerPtr<VerifyBlockEvent>>,
        collect_tx: Option<HandlerPtr<CollectTxEvent>>,
        view_change_start: Option<HandlerPtr<ViewChangeStartEvent>>,
        view_change_complete: Option<HandlerPtr<ViewChangeCompleteEvent>>,
        start_catch_up: Option<HandlerPtr<StartCatchUpEvent>>,
        end_catch_up: Option<HandlerPtr<EndCatchUpEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            commit_block: HandlerPair::new(log, commit_block),
            propose_block: HandlerPair::new(log, propose_block),
            verify_block: HandlerPair::new(log, verify_block),
            collect_tx: HandlerPair::new(log, collect_tx),
            view_change_start: HandlerPair::new(log, view_change_start),
            view_change_complete: HandlerPair::new(log, view_change_complete),
            start_catch_up: HandlerPair::new(log, start_catch_up),
            end_catch_up: HandlerPair::new(log, end_catch_up),
        }
    }

    /// Handlers with no user closures; logging only when `log` is set.
    pub fn default_handlers(log: bool) -> EventHandlers {
        Self::new(log, None, None, None, None, None, None, None, None)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commit_block.is_empty()
            && self.propose_block.is_empty()
            && self.verify_block.is_empty()
            && self.collect_tx.is_empty()
            && self.view_change_start.is_empty()
            && self.view_change_complete.is_empty()
            && self.start_catch_up.is_empty()
            && self.end_catch_up.is_empty()
    }
}

/// Spawn the event bus thread. It drains the event channel and triggers the registered handlers,
/// then exits when the shutdown signal arrives and the channel is empty.
pub(crate) fn start_event_bus(
    handlers: EventHandlers,
    events: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => {
                // Drain what is left, then exit.
                while let Ok(event) = events.try_recv() {
                    handle(&handlers, event);
                }
                return;
            }
            Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }
        match events.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => handle(&handlers, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

fn handle(handlers: &EventHandlers, event: Event) {
    match event {
        Event::CommitBlock(e) => handlers.commit_block.handle(&e),
        Event::ProposeBlock(e) => handlers.propose_block.handle(&e),
        Event::VerifyBlock(e) => handlers.verify_block.handle(&e),
        Event::CollectTx(e) => handlers.collect_tx.handle(&e),
        Event::ViewChangeStart(e) => handlers.view_change_start.handle(&e),
        Event::ViewChangeComplete(e) => handlers.view_change_complete.handle(&e),
        Event::StartCatchUp(e) => handlers.start_catch_up.handle(&e),
        Event::EndCatchUp(e) => handlers.end_catch_up.handle(&e),
    }
}
