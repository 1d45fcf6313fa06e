use crate::NarrativeError;
use crate::cli::{AdvanceArgs, StartArgs, UserArgs};
use crate::events::{NarrativeEvent, NotificationSink};
use crate::orchestrator::{NarrativeOrchestrator, Transition};
use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> Result<(), NarrativeError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn emit(sink: &dyn NotificationSink, user_id: &str, transition: &Transition) -> Result<(), NarrativeError> {
    sink.publish(user_id, &transition.events);
    print_json(transition)
}

pub async fn handle_start(
    orch: &NarrativeOrchestrator,
    sink: &dyn NotificationSink,
    args: &StartArgs,
) -> Result<(), NarrativeError> {
    let transition = orch.start(&args.user, &args.fragment).await?;
    emit(sink, &args.user, &transition)
}

pub async fn handle_advance(
    orch: &NarrativeOrchestrator,
    sink: &dyn NotificationSink,
    args: &AdvanceArgs,
) -> Result<(), NarrativeError> {
    let transition = orch.advance(&args.user, args.choice).await?;
    emit(sink, &args.user, &transition)
}

pub async fn handle_finish(
    orch: &NarrativeOrchestrator,
    sink: &dyn NotificationSink,
    args: &UserArgs,
) -> Result<(), NarrativeError> {
    let transition = orch.finish(&args.user).await?;
    if transition.grant.already_completed {
        eprintln!("narrative: {} already completed", transition.fragment.id);
    }
    emit(sink, &args.user, &transition)
}

pub async fn handle_show(orch: &NarrativeOrchestrator, args: &UserArgs) -> Result<(), NarrativeError> {
    let view = orch.current_view(&args.user).await?;
    print_json(&view)
}

pub async fn handle_progress(orch: &NarrativeOrchestrator, args: &UserArgs) -> Result<(), NarrativeError> {
    let summary = orch.get_progress(&args.user).await?;
    print_json(&summary)
}

pub async fn handle_reset(
    orch: &NarrativeOrchestrator,
    sink: &dyn NotificationSink,
    args: &UserArgs,
) -> Result<(), NarrativeError> {
    orch.reset(&args.user).await?;
    sink.publish(&args.user, &[NarrativeEvent::ProgressReset]);
    eprintln!("narrative: reset progress for {}", args.user);
    Ok(())
}
