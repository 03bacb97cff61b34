//! Actor Protocol Scenarios
//!
//! Step-by-step message sequences driven through a recording context, one
//! message at a time, checking exactly what each actor sends.

use dataflow_actors::test_utils::{ManualTransport, RecordingContext, TaskBuilder};
use dataflow_actors::{
    Actor, ActorCommand, ActorError, ActorMessage, ActorState, Collected, KernelRegistry,
    MessageKind,
};
use std::sync::Arc;
use types::{ActorId, PieceId, PortId, TaskDescriptor};

fn init(task: &TaskDescriptor, transport: Arc<ManualTransport>) -> Actor {
    Actor::init(
        task,
        2,
        &KernelRegistry::with_builtins(Collected::default()),
        transport,
    )
    .unwrap()
}

fn start(actor: &mut Actor, ctx: &mut RecordingContext) {
    let id = actor.id();
    actor
        .process_message(ActorMessage::command(ActorId(0), id, ActorCommand::Start), ctx)
        .unwrap();
}

#[test]
fn test_source_stalls_at_depth_until_return() {
    let task = TaskBuilder::source(1, 3).output(0, &[2], 8).depth(2).build();
    let mut source = init(&task, Arc::new(ManualTransport::new()));
    let mut ctx = RecordingContext::new();

    start(&mut source, &mut ctx);
    let first = ctx.produced_handles();
    assert_eq!(
        first.iter().map(|h| h.piece()).collect::<Vec<_>>(),
        vec![PieceId(0), PieceId(1)]
    );
    assert_eq!(source.in_flight(PortId(0)), Some(2));
    assert!(ctx.end_of_streams().is_empty());

    // Returning piece 1 first frees a slot just the same
    ctx.clear();
    source
        .process_message(
            ActorMessage::returned(ActorId(2), ActorId(1), first[1].to_ref()),
            &mut ctx,
        )
        .unwrap();
    let third = ctx.produced_handles();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].piece(), PieceId(2));
    assert_eq!(third[0].id(), first[1].id());
    assert!(third[0].generation() > first[1].generation());
    assert_eq!(ctx.end_of_streams().len(), 1);
    assert_eq!(source.state(), ActorState::Running);

    ctx.clear();
    for handle in [&first[0], &third[0]] {
        source
            .process_message(
                ActorMessage::returned(ActorId(2), ActorId(1), handle.to_ref()),
                &mut ctx,
            )
            .unwrap();
    }
    assert!(ctx.produced().is_empty());
    assert!(source.is_terminal());
    assert_eq!(source.in_flight(PortId(0)), Some(0));
}

#[test]
fn test_stale_return_is_fatal() {
    let task = TaskBuilder::source(1, 4).output(0, &[2], 8).depth(1).build();
    let mut source = init(&task, Arc::new(ManualTransport::new()));
    let mut ctx = RecordingContext::new();

    start(&mut source, &mut ctx);
    let piece0 = ctx.produced_handles()[0].clone();
    source
        .process_message(
            ActorMessage::returned(ActorId(2), ActorId(1), piece0.to_ref()),
            &mut ctx,
        )
        .unwrap();

    // Same slot, old generation
    let err = source
        .process_message(
            ActorMessage::returned(ActorId(2), ActorId(1), piece0.to_ref()),
            &mut ctx,
        )
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ActorError::Protocol { .. }));
}

#[test]
fn test_identity_forwards_and_returns_after_fire() {
    let transport = Arc::new(ManualTransport::new());
    let task = TaskBuilder::compute(2, "identity")
        .input(0, 1, 0)
        .output(1, &[3], 8)
        .depth(1)
        .build();
    let mut stage = init(&task, transport);
    let mut ctx = RecordingContext::new();

    let input = TaskBuilder::handle(1, 0, 0, b"abc");
    stage
        .process_message(ActorMessage::produced(ActorId(1), ActorId(2), input.clone()), &mut ctx)
        .unwrap();

    let out = ctx.produced_handles();
    assert_eq!(out.len(), 1);
    assert_eq!(&out[0].payload().unwrap()[..], b"abc");
    let returned = ctx.returned();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].dst, ActorId(1));
    assert!(matches!(returned[0].kind, MessageKind::Returned(r) if r == input.to_ref()));

    // Output full: next input waits in the queue and nothing is returned
    ctx.clear();
    let second = TaskBuilder::handle(1, 0, 1, b"def");
    stage
        .process_message(ActorMessage::produced(ActorId(1), ActorId(2), second), &mut ctx)
        .unwrap();
    assert!(ctx.sent.is_empty());

    stage
        .process_message(
            ActorMessage::returned(ActorId(3), ActorId(2), out[0].to_ref()),
            &mut ctx,
        )
        .unwrap();
    let out = ctx.produced_handles();
    assert_eq!(out.len(), 1);
    assert_eq!(&out[0].payload().unwrap()[..], b"def");
}

#[test]
fn test_copy_actor_eos_before_completion() {
    let transport = Arc::new(ManualTransport::new());
    let task = TaskBuilder::network_copy(2, 1)
        .input(0, 1, 0)
        .output(1, &[3], 8)
        .depth(2)
        .build();
    let mut copy = init(&task, transport.clone());
    let mut ctx = RecordingContext::new();

    let handle = TaskBuilder::remote_handle(&transport, 1, 0, 5, b"piece-5");
    copy.process_message(ActorMessage::produced(ActorId(1), ActorId(2), handle), &mut ctx)
        .unwrap();
    copy.process_message(ActorMessage::end_of_stream(ActorId(1), ActorId(2), PortId(0)), &mut ctx)
        .unwrap();

    assert_eq!(transport.held_pieces(), vec![PieceId(5)]);
    assert!(ctx.end_of_streams().is_empty());
    assert!(!copy.is_terminal());

    assert!(transport.complete_piece(PieceId(5)));
    for msg in ctx.take_transfer_events() {
        copy.process_message(msg, &mut ctx).unwrap();
    }

    let released = ctx.produced_handles();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].piece(), PieceId(5));
    assert_eq!(&released[0].payload().unwrap()[..], b"piece-5");
    assert_eq!(ctx.returned().len(), 1);

    // EndOfStream follows the last Produced on the same output
    let last_produced = ctx
        .sent
        .iter()
        .rposition(|m| matches!(m.kind, MessageKind::Produced(_)))
        .unwrap();
    let eos = ctx
        .sent
        .iter()
        .position(|m| matches!(m.kind, MessageKind::EndOfStream { .. }))
        .unwrap();
    assert!(eos > last_produced);

    ctx.clear();
    copy.process_message(
        ActorMessage::returned(ActorId(3), ActorId(2), released[0].to_ref()),
        &mut ctx,
    )
    .unwrap();
    assert!(copy.is_terminal());
}

#[test]
fn test_one_eos_per_consumer_then_terminal() {
    let task = TaskBuilder::compute(2, "identity")
        .input(0, 1, 0)
        .output(1, &[3, 4], 8)
        .build();
    let mut stage = init(&task, Arc::new(ManualTransport::new()));
    let mut ctx = RecordingContext::new();

    stage
        .process_message(
            ActorMessage::produced(ActorId(1), ActorId(2), TaskBuilder::handle(1, 0, 0, b"x")),
            &mut ctx,
        )
        .unwrap();
    let out = ctx.produced_handles();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|h| h.id() == out[0].id()));

    stage
        .process_message(ActorMessage::end_of_stream(ActorId(1), ActorId(2), PortId(0)), &mut ctx)
        .unwrap();
    let eos: Vec<_> = ctx.end_of_streams().iter().map(|m| m.dst).collect();
    assert_eq!(eos, vec![ActorId(3), ActorId(4)]);

    // Both consumers must return before the register is free again
    stage
        .process_message(
            ActorMessage::returned(ActorId(3), ActorId(2), out[0].to_ref()),
            &mut ctx,
        )
        .unwrap();
    assert!(!stage.is_terminal());
    stage
        .process_message(
            ActorMessage::returned(ActorId(4), ActorId(2), out[0].to_ref()),
            &mut ctx,
        )
        .unwrap();
    assert!(stage.is_terminal());
    assert_eq!(ctx.end_of_streams().len(), 2);

    let err = stage
        .process_message(
            ActorMessage::produced(ActorId(1), ActorId(2), TaskBuilder::handle(1, 0, 1, b"y")),
            &mut ctx,
        )
        .unwrap_err();
    assert!(matches!(err, ActorError::Protocol { .. }));
}

#[test]
fn test_return_from_non_consumer_rejected() {
    let task = TaskBuilder::source(1, 1).output(0, &[2], 8).build();
    let mut source = init(&task, Arc::new(ManualTransport::new()));
    let mut ctx = RecordingContext::new();

    start(&mut source, &mut ctx);
    let handle = ctx.produced_handles()[0].clone();
    let err = source
        .process_message(
            ActorMessage::returned(ActorId(9), ActorId(1), handle.to_ref()),
            &mut ctx,
        )
        .unwrap_err();
    assert!(err.is_fatal());
}
