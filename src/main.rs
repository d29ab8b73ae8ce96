use std::{process, sync::Arc};

use chrono_tz::Tz;
use daybook::{
    application::{
        auth::{AuthSession, Credential},
        engine::CacheEngine,
        error::{AppError, ErrorReport},
        gateway::RemoteGateway,
        mutations::MutationKind,
    },
    cache::CacheConfig,
    config::{self, AuthSettings, Command, MemosCommand, ProfileCommand, TaskEditArgs, TasksCommand},
    domain::entities::TaskPatch,
    infra::{rest::RestGateway, telemetry},
    util::timezone::localized_date,
};
use daybook_api_types::ProfileChanges;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let message = error.user_message();
    let report = ErrorReport::from_error("daybook::main", error);
    let emit = || {
        error!(
            source = report.source,
            chain = ?report.messages,
            user_message = %message,
            "application error"
        );
    };

    if dispatcher::has_been_set() {
        emit();
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, emit);
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let command = cli_args.command.unwrap_or_default();
    let gateway: Arc<dyn RemoteGateway> =
        Arc::new(RestGateway::from_settings(&settings.remote).map_err(AppError::from)?);
    let auth = Arc::new(session(&settings.auth));

    let engine = CacheEngine::new(CacheConfig::from(&settings), gateway, auth);
    engine.start();
    let result = execute(&engine, command, settings.calendar.timezone).await;
    engine.dispose().await;

    print_json(&result?)
}

/// Signed in when both user id and token are configured; signed out otherwise.
fn session(auth: &AuthSettings) -> AuthSession {
    match (auth.user_id, auth.access_token.as_ref()) {
        (Some(user_id), Some(token)) => {
            AuthSession::with_credential(Credential::new(user_id, token.clone()))
        }
        _ => {
            info!("No credential configured; remote calls will be rejected");
            AuthSession::new()
        }
    }
}

async fn execute(engine: &CacheEngine, command: Command, timezone: Tz) -> Result<Value, AppError> {
    match command {
        Command::Tasks(command) => execute_tasks(engine, command, timezone).await,
        Command::Memos(command) => execute_memos(engine, command).await,
        Command::Profile(command) => execute_profile(engine, command).await,
    }
}

async fn execute_tasks(
    engine: &CacheEngine,
    command: TasksCommand,
    timezone: Tz,
) -> Result<Value, AppError> {
    match command {
        TasksCommand::List(list) => {
            let tasks = if list.uncompleted {
                engine.uncompleted_tasks().await?
            } else if let Some((year, month)) = list.month {
                engine.tasks_in_month(year, month).await?
            } else {
                let date = list
                    .date
                    .unwrap_or_else(|| localized_date(OffsetDateTime::now_utc(), timezone));
                engine.tasks_on(date).await?
            };
            to_json(&tasks)
        }
        TasksCommand::Show { id } => to_json(&engine.task(id).await?),
        TasksCommand::Add { title, category } => {
            to_json(&engine.mutate(MutationKind::CreateTask { title, category }).await?)
        }
        TasksCommand::Toggle { id } => {
            let task = engine.task(id).await?;
            let kind = MutationKind::ToggleTask {
                id,
                is_completed: !task.is_completed,
            };
            to_json(&engine.mutate(kind).await?)
        }
        TasksCommand::Rename { id, title } => {
            to_json(&engine.mutate(MutationKind::RenameTask { id, title }).await?)
        }
        TasksCommand::Edit(args) => {
            let id = args.id;
            let kind = MutationKind::UpdateTask {
                id,
                patch: task_patch(args),
            };
            to_json(&engine.mutate(kind).await?)
        }
        TasksCommand::Delete { id } => {
            to_json(&engine.mutate(MutationKind::DeleteTask { id }).await?)
        }
    }
}

fn task_patch(args: TaskEditArgs) -> TaskPatch {
    TaskPatch {
        title: args.title,
        description: if args.clear_description {
            Some(None)
        } else {
            args.description.map(Some)
        },
        category: args.category,
        due_date: if args.clear_due {
            Some(None)
        } else {
            args.due.map(Some)
        },
        is_completed: None,
    }
}

async fn execute_memos(engine: &CacheEngine, command: MemosCommand) -> Result<Value, AppError> {
    match command {
        MemosCommand::List => to_json(&engine.memos().await?),
        MemosCommand::Add { content } => {
            to_json(&engine.mutate(MutationKind::CreateMemo { content }).await?)
        }
        MemosCommand::Edit { id, content } => {
            to_json(&engine.mutate(MutationKind::UpdateMemo { id, content }).await?)
        }
        MemosCommand::Pin { id } => {
            let memo = engine
                .memos()
                .await?
                .into_iter()
                .find(|memo| memo.id == id)
                .ok_or_else(|| AppError::validation(format!("memo {id} does not exist")))?;
            let kind = MutationKind::ToggleMemoPin {
                id,
                pinned: !memo.is_pinned,
            };
            to_json(&engine.mutate(kind).await?)
        }
        MemosCommand::Delete { ids } => {
            let kind = match ids.as_slice() {
                [id] => MutationKind::DeleteMemo { id: *id },
                _ => MutationKind::DeleteMemos { ids },
            };
            to_json(&engine.mutate(kind).await?)
        }
    }
}

async fn execute_profile(engine: &CacheEngine, command: ProfileCommand) -> Result<Value, AppError> {
    match command {
        ProfileCommand::Show => to_json(&engine.profile().await?),
        ProfileCommand::Update(args) => {
            let changes = ProfileChanges {
                display_name: args.display_name.map(Some),
                profile_picture_url: args.profile_picture_url.map(Some),
                theme_color: args.theme_color.map(Some),
                language: args.language.map(Some),
            };
            to_json(&engine.mutate(MutationKind::UpdateProfile { changes }).await?)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::unexpected(format!("failed to serialize output: {err}")))
}

fn print_json(value: &Value) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to serialize output: {err}")))?;
    println!("{text}");
    Ok(())
}
