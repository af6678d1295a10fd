//! The scheduler: a time-ordered queue of deferred function invocations.
//!
//! Each request owns a prebuilt `FunctionContext` whose parameter types
//! were inferred from the values pushed at construction (the only place
//! parameter types are inferred rather than declared). Dispatch happens
//! from the context's `update(now)`: the scheduler hands back every due
//! request — earlier fire times first, enqueue order among ties — and the
//! context runs each through the shared scheduled-execution path.
//!
//! Only one schedule may be under construction at a time (the "current
//! schedule" slot between `ScheduleBegin` and `ScheduleEnd`).

use crate::error::{ScriptError, ScriptResult};
use crate::function::FunctionContext;
use crate::value::VarType;

/// A pending deferred call.
#[derive(Debug)]
pub struct ScheduleRequest {
    pub request_id: i32,
    /// Absolute fire time in the embedder's millisecond clock.
    pub fire_time: u32,
    /// Target object id, 0 for a global function.
    pub object_id: u32,
    pub func_hash: u32,
    /// Re-enqueue period; `None` for one-shot requests.
    pub repeat_period: Option<u32>,
    /// Prebuilt parameters; index 0 is the `__resolve` return slot.
    pub context: FunctionContext,
    /// Fire synchronously at `ScheduleEnd` instead of enqueueing.
    pub immediate: bool,
    /// Tie-break: preserves enqueue order among equal fire times.
    sequence: u64,
}

/// Priority queue of deferred invocations plus the in-construction slot.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: Vec<ScheduleRequest>,
    /// The schedule being assembled between `ScheduleBegin`/`ScheduleEnd`.
    current: Option<ScheduleRequest>,
    next_request_id: i32,
    next_sequence: u64,
    /// Last `update` timestamp; new requests fire relative to this clock.
    now: u32,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn now(&self) -> u32 {
        self.now
    }

    /// Begins constructing a request. Fatal if one is already open.
    pub fn begin(&mut self, object_id: u32, delay_ms: i32, func_hash: u32, immediate: bool) -> ScriptResult<()> {
        if self.current.is_some() {
            return Err(ScriptError::resource("a schedule() is already being processed"));
        }
        self.next_request_id += 1;
        let delay = if delay_ms > 0 { delay_ms as u32 } else { 0 };
        let mut context = FunctionContext::new();
        context
            .add_parameter_at(0, "__return", crate::hash::hash_string("__return"), VarType::Resolve)
            .expect("return slot always fits");
        self.current = Some(ScheduleRequest {
            request_id: self.next_request_id,
            fire_time: self.now.saturating_add(delay),
            object_id,
            func_hash,
            repeat_period: None,
            context,
            immediate,
            sequence: 0,
        });
        Ok(())
    }

    /// The request under construction.
    pub fn current_mut(&mut self) -> ScriptResult<&mut ScheduleRequest> {
        self.current
            .as_mut()
            .ok_or_else(|| ScriptError::resource("there is no schedule() being processed"))
    }

    /// Finishes construction, returning the assembled request.
    pub fn end(&mut self) -> ScriptResult<ScheduleRequest> {
        self.current
            .take()
            .ok_or_else(|| ScriptError::resource("there is no schedule() being processed"))
    }

    /// Enqueues an assembled request.
    pub fn enqueue(&mut self, mut request: ScheduleRequest) {
        self.next_sequence += 1;
        request.sequence = self.next_sequence;
        self.queue.push(request);
    }

    /// Builds and enqueues a host-side request directly, returning its id.
    pub fn enqueue_host_request(
        &mut self,
        object_id: u32,
        delay_ms: u32,
        func_hash: u32,
        repeat_period: Option<u32>,
        context: FunctionContext,
    ) -> i32 {
        self.next_request_id += 1;
        let id = self.next_request_id;
        self.next_sequence += 1;
        self.queue.push(ScheduleRequest {
            request_id: id,
            fire_time: self.now.saturating_add(delay_ms),
            object_id,
            func_hash,
            repeat_period,
            context,
            immediate: false,
            sequence: self.next_sequence,
        });
        id
    }

    /// Advances the clock and removes every due request, earliest fire
    /// time first, enqueue order among ties.
    pub fn take_due(&mut self, now: u32) -> Vec<ScheduleRequest> {
        self.now = now;
        let mut due: Vec<ScheduleRequest> = Vec::new();
        let mut remaining: Vec<ScheduleRequest> = Vec::with_capacity(self.queue.len());
        for request in self.queue.drain(..) {
            if request.fire_time <= now {
                due.push(request);
            } else {
                remaining.push(request);
            }
        }
        self.queue = remaining;
        due.sort_by_key(|r| (r.fire_time, r.sequence));
        due
    }

    /// Re-enqueues a repeating request for its next period.
    pub fn reschedule_repeat(&mut self, mut request: ScheduleRequest) {
        if let Some(period) = request.repeat_period {
            request.fire_time = self.now.saturating_add(period.max(1));
            self.next_sequence += 1;
            request.sequence = self.next_sequence;
            self.queue.push(request);
        }
    }

    /// Cancels a pending request by id. Cancelling a request already
    /// executing (no longer queued) is a no-op.
    pub fn cancel_request(&mut self, request_id: i32) {
        self.queue.retain(|r| r.request_id != request_id);
    }

    /// Cancels every pending request owned by an object.
    pub fn cancel_object(&mut self, object_id: u32) {
        self.queue.retain(|r| r.object_id != object_id);
    }

    /// Pending request count (diagnostics).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Pending requests as `(request_id, fire_time, object_id, func_hash)`
    /// tuples, for diagnostic dumps.
    #[must_use]
    pub fn pending_summary(&self) -> Vec<(i32, u32, u32, u32)> {
        self.queue
            .iter()
            .map(|r| (r.request_id, r.fire_time, r.object_id, r.func_hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(scheduler: &mut Scheduler, delay: i32, func_hash: u32) -> i32 {
        scheduler.begin(0, delay, func_hash, false).unwrap();
        let request = scheduler.end().unwrap();
        let id = request.request_id;
        scheduler.enqueue(request);
        id
    }

    #[test]
    fn due_requests_fire_in_time_order() {
        let mut scheduler = Scheduler::new();
        enqueue(&mut scheduler, 300, 3);
        enqueue(&mut scheduler, 100, 1);
        enqueue(&mut scheduler, 200, 2);

        let due = scheduler.take_due(250);
        let order: Vec<u32> = due.iter().map(|r| r.func_hash).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[test]
    fn ties_fire_in_enqueue_order() {
        let mut scheduler = Scheduler::new();
        enqueue(&mut scheduler, 100, 10);
        enqueue(&mut scheduler, 100, 20);
        let due = scheduler.take_due(100);
        let order: Vec<u32> = due.iter().map(|r| r.func_hash).collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn cancel_by_request_id() {
        let mut scheduler = Scheduler::new();
        let id = enqueue(&mut scheduler, 100, 1);
        enqueue(&mut scheduler, 100, 2);
        scheduler.cancel_request(id);
        let due = scheduler.take_due(100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].func_hash, 2);
    }

    #[test]
    fn cancel_by_object() {
        let mut scheduler = Scheduler::new();
        scheduler.begin(7, 50, 1, false).unwrap();
        let request = scheduler.end().unwrap();
        scheduler.enqueue(request);
        enqueue(&mut scheduler, 50, 2);
        scheduler.cancel_object(7);
        assert_eq!(scheduler.pending_count(), 1);
    }

    #[test]
    fn only_one_schedule_under_construction() {
        let mut scheduler = Scheduler::new();
        scheduler.begin(0, 10, 1, false).unwrap();
        assert!(scheduler.begin(0, 10, 2, false).is_err());
    }

    #[test]
    fn repeat_requests_reschedule() {
        let mut scheduler = Scheduler::new();
        let mut context = FunctionContext::new();
        context
            .add_parameter_at(0, "__return", crate::hash::hash_string("__return"), VarType::Resolve)
            .unwrap();
        scheduler.enqueue_host_request(0, 100, 9, Some(100), context);

        let due = scheduler.take_due(100);
        assert_eq!(due.len(), 1);
        for request in due {
            scheduler.reschedule_repeat(request);
        }
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.pending_summary()[0].1, 200);
    }
}
