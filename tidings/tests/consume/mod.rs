use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tidings::{
    store::{partition_of, MessageKey, Payload, Record, Store},
    Broker, BrokerRecord, BusinessTransactionManager, CommandHandler, Config, Consumer, Context,
    DocumentRef, Engine, Error, EventBus, EventHandler, EventStore, Outcome, Projections,
    Registry, Relay, Restore, ToCommandHandler,
};
use uuid::Uuid;

use crate::common::{
    config, registry, Project, ProjectEvent, ProjectHandler, ProjectView, Task, TaskEvent,
    TaskHandler, TaskTombstoneHandler, TaskView, PROJECTS, TASKS,
};

fn bus(store: &Store) -> EventBus {
    EventStore::new(store.clone())
        .config(config())
        .event_bus(Context::system())
}

fn consumer<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    engine: &E,
    broker: &B,
) -> Consumer {
    Consumer::new(engine.clone(), broker.clone())
        .name("online")
        .registry(registry())
        .config(config())
}

fn restore<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    engine: &E,
    broker: &B,
) -> Restore {
    Restore::new(engine.clone(), broker.clone())
        .registry(registry())
        .config(config())
}

async fn relay<B: Broker + Clone + 'static>(store: &Store, broker: &B) -> Result<usize> {
    Ok(Relay::new(store.clone(), broker.clone())
        .config(config())
        .feed()
        .await?)
}

async fn publish<B: Broker>(broker: &B, record: &Record) -> Result<BrokerRecord> {
    let (key, payload) = record.encode()?;
    let partition = record.key.partition(broker.partitions());
    let offset = broker.publish(partition, &key, payload.as_deref()).await?;

    broker
        .fetch(partition, offset, 1)
        .await?
        .pop()
        .ok_or_else(|| anyhow::anyhow!("record {offset} missing"))
}

fn started(transaction_id: Uuid, root_context_id: Uuid) -> Record {
    let key = MessageKey::new("BUSINESS_TRANSACTION", transaction_id, 0, root_context_id)
        .business_transaction(transaction_id);

    Record::new(key, Payload::transaction_started(transaction_id))
}

fn project_created(project: &Project, transaction_id: Option<Uuid>) -> Result<Record> {
    let mut key = MessageKey::new("PROJECT", project.id, project.version, project.id);
    key.business_transaction_id = transaction_id;

    Ok(Record::new(
        key,
        Payload::new(ProjectEvent::Created).data(project)?,
    ))
}

/// Creates a project with two tasks, completes the first task and renames the project.
async fn seed(store: &Store) -> Result<(Project, Vec<Task>)> {
    let bus = bus(store);

    let project = CommandHandler::create(Project::new("Apollo"))
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    let mut tasks = Vec::new();

    for title in ["Design lander", "Train crew"] {
        tasks.push(
            CommandHandler::create(Task::new(&project, title))
                .emit_event(TaskEvent::Created)
                .to(&bus)
                .await?,
        );
    }

    tasks[0] = tasks[0]
        .clone()
        .to_command_handler()
        .apply_changes(|task| task.done = true)
        .emit_event(TaskEvent::Updated)
        .to(&bus)
        .await?;

    let project = project
        .to_command_handler()
        .update(|mut project| {
            project.title = "Apollo 11".to_owned();
            project
        })
        .emit_event(ProjectEvent::Updated)
        .to(&bus)
        .await?;

    Ok((project, tasks))
}

async fn all_documents<E: Engine>(engine: &E) -> Result<Vec<tidings::Document>> {
    let mut documents = engine.documents(PROJECTS).await?;
    documents.extend(engine.documents(TASKS).await?);

    Ok(documents)
}

pub async fn test_consume<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let (project, tasks) = seed(store).await?;

    assert_eq!(relay(store, broker).await?, 5);

    let consumer = consumer(engine, broker);
    assert_eq!(consumer.drain().await?, 5);
    assert_eq!(consumer.drain().await?, 0);

    let view = engine
        .document(PROJECTS, project.id)
        .await?
        .expect("project document");

    assert_eq!(view.version, 1);
    assert_eq!(
        view.to_data::<ProjectView>()?,
        ProjectView {
            title: "Apollo 11".to_owned(),
            revision: 1
        }
    );

    let children = engine
        .children(&DocumentRef::new(PROJECTS, project.id))
        .await?;

    assert_eq!(children.len(), 2);

    let done = engine
        .document(TASKS, tasks[0].id)
        .await?
        .expect("task document");

    assert_eq!(done.version, 1);
    assert!(done.to_data::<TaskView>()?.done);

    let partition = partition_of(project.id, 4);
    assert_eq!(
        engine.offset("online", partition).await?,
        Some(broker.end_offset(partition).await?)
    );

    // redelivering the whole partition changes nothing
    let before = all_documents(engine).await?;
    let manager = consumer.manager();

    for record in broker.fetch(partition, 0, 100).await? {
        assert_eq!(manager.process(&record).await?, Outcome::Skipped);
    }

    assert_eq!(all_documents(engine).await?, before);

    Ok(())
}

pub async fn test_consumer_start<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    consumer(engine, broker).start(0).await?;
    Relay::new(store.clone(), broker.clone())
        .config(config())
        .start(0)
        .await?;

    let project = CommandHandler::create(Project::new("Mercury"))
        .emit_event(ProjectEvent::Created)
        .to(&bus(store))
        .await?;

    tokio::time::sleep(Duration::from_millis(600)).await;

    let view = engine
        .document(PROJECTS, project.id)
        .await?
        .expect("project document");

    assert_eq!(view.to_data::<ProjectView>()?.title, "Mercury");

    Ok(())
}

pub async fn test_business_transaction<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let bus = bus(store);
    let project = Project::new("Artemis");
    let tx = bus.begin_business_transaction(project.id)?;
    let transaction_id = tx.id();

    let project = CommandHandler::create(project)
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    let task = CommandHandler::create(Task::new(&project, "Build rocket"))
        .emit_event(TaskEvent::Created)
        .to(&bus)
        .await?;

    tx.finish().await?;
    relay(store, broker).await?;

    let partition = partition_of(project.id, 4);
    let records = broker.fetch(partition, 0, 100).await?;
    assert_eq!(records.len(), 4);

    let manager = consumer(engine, broker).manager();

    for record in records[..3].iter() {
        assert_eq!(manager.process(record).await?, Outcome::Buffered);
    }

    assert_eq!(engine.document(PROJECTS, project.id).await?, None);
    assert_eq!(engine.document(TASKS, task.id).await?, None);

    let open = manager.open_transactions().await?;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].transaction_id, transaction_id);
    assert_eq!(open[0].partition, partition);
    assert_eq!(open[0].records, 3);

    assert_eq!(manager.stale_transactions(Duration::ZERO).await?.len(), 1);
    assert!(manager
        .stale_transactions(Duration::from_secs(3600))
        .await?
        .is_empty());

    assert_eq!(manager.process(&records[3]).await?, Outcome::Applied(2));

    assert!(engine.document(PROJECTS, project.id).await?.is_some());
    assert!(engine.document(TASKS, task.id).await?.is_some());
    assert!(manager.open_transactions().await?.is_empty());
    assert!(engine.buffered("online", transaction_id).await?.is_empty());
    assert_eq!(
        engine
            .finished("online", transaction_id)
            .await?
            .map(|f| f.offset),
        Some(3)
    );

    let before = all_documents(engine).await?;

    for record in records.iter() {
        assert_eq!(manager.process(record).await?, Outcome::Skipped);
    }

    assert_eq!(all_documents(engine).await?, before);

    Ok(())
}

pub async fn test_out_of_order_transaction<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    broker: &B,
    engine: &E,
) -> Result<()> {
    let consumer = consumer(engine, broker);
    let manager = consumer.manager();
    let project = Project::new("Orphan");
    let partition = partition_of(project.id, 4);
    let transaction_id = Uuid::new_v4();

    let orphan = publish(broker, &project_created(&project, Some(transaction_id))?).await?;

    let err = manager.process(&orphan).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownOrOutOfOrderTransaction { transaction_id: id, .. } if id == transaction_id
    ));
    assert!(err.is_fatal());

    let err = consumer.poll(partition).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(engine.offset("online", partition).await?, None);
    assert_eq!(engine.document(PROJECTS, project.id).await?, None);

    Ok(())
}

pub async fn test_transaction_across_partitions<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    broker: &B,
    engine: &E,
) -> Result<()> {
    let manager = consumer(engine, broker).manager();
    let project = Project::new("Apollo");
    let other = loop {
        let other = Project::new("Gemini");

        if partition_of(other.id, 4) != partition_of(project.id, 4) {
            break other;
        }
    };

    let transaction_id = Uuid::new_v4();
    let started = publish(broker, &started(transaction_id, project.id)).await?;
    let stray = publish(broker, &project_created(&other, Some(transaction_id))?).await?;

    assert_eq!(manager.process(&started).await?, Outcome::Buffered);
    assert!(matches!(
        manager.process(&stray).await,
        Err(Error::UnknownOrOutOfOrderTransaction { .. })
    ));

    Ok(())
}

pub async fn test_restore<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let (project, tasks) = seed(store).await?;
    relay(store, broker).await?;

    let report = restore(engine, broker).run().await?;

    assert_eq!(report.applied(), 5);
    assert_eq!(report.buffered(), 0);
    assert!(report.open_transactions.is_empty());

    let restored = all_documents(engine).await?;
    assert_eq!(restored.len(), 3);

    let view = engine
        .document(PROJECTS, project.id)
        .await?
        .expect("project document")
        .to_data::<ProjectView>()?;

    assert_eq!(view.title, "Apollo 11");
    assert!(engine
        .document(TASKS, tasks[0].id)
        .await?
        .expect("task document")
        .to_data::<TaskView>()?
        .done);

    let again = restore(engine, broker).run().await?;

    assert_eq!(again, report);
    assert_eq!(all_documents(engine).await?, restored);

    // an online consumer catching up on the same log agrees with the restore
    consumer(engine, broker).drain().await?;
    assert_eq!(all_documents(engine).await?, restored);

    Ok(())
}

pub async fn test_restore_tombstone<E: Engine + Clone + 'static, B: Broker + Clone + 'static>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let (project, tasks) = seed(store).await?;

    project
        .clone()
        .to_command_handler()
        .emit_tombstone()
        .to(&bus(store))
        .await?;

    relay(store, broker).await?;
    restore(engine, broker).run().await?;

    assert_eq!(engine.document(PROJECTS, project.id).await?, None);

    for task in tasks {
        assert_eq!(engine.document(TASKS, task.id).await?, None);
    }

    Ok(())
}

pub async fn test_restore_unknown_kind<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let bus = bus(store);

    CommandHandler::create(Project::new("Skylab"))
        .emit_event(ProjectEvent::Archived)
        .to(&bus)
        .await?;

    relay(store, broker).await?;

    let err = restore(engine, broker).run().await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err,
        Error::InvalidEventKind { aggregate_type, kind: Some(kind) }
            if aggregate_type == "PROJECT" && kind == "ARCHIVED"
    ));

    Ok(())
}

pub async fn test_restore_ahead_of_online<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let bus = bus(store);

    let project = CommandHandler::create(Project::new("Salyut"))
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    project
        .clone()
        .to_command_handler()
        .update(|mut project| {
            project.title = "Mir".to_owned();
            project
        })
        .emit_event(ProjectEvent::Updated)
        .to(&bus)
        .await?;

    relay(store, broker).await?;

    let partition = partition_of(project.id, 4);

    let err = restore(engine, broker)
        .max_offset(partition, 0)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::RestoreAheadOfOnline {
            offset: 1,
            max_offset: 0,
            ..
        }
    ));
    assert_eq!(engine.document(PROJECTS, project.id).await?, None);

    let report = restore(engine, broker)
        .max_offset(partition, 1)
        .run()
        .await?;

    assert_eq!(report.applied(), 2);

    Ok(())
}

pub async fn test_restore_open_transaction<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    broker: &B,
    engine: &E,
) -> Result<()> {
    let project = Project::new("Unfinished");
    let transaction_id = Uuid::new_v4();

    publish(broker, &started(transaction_id, project.id)).await?;
    publish(broker, &project_created(&project, Some(transaction_id))?).await?;

    let audit = Uuid::new_v4();
    publish(
        broker,
        &Record::new(
            MessageKey::new("AUDIT", audit, 0, audit),
            Payload::new("RECORDED"),
        ),
    )
    .await?;

    let report = restore(engine, broker).run().await?;

    assert_eq!(report.buffered(), 2);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.applied(), 0);
    assert_eq!(report.open_transactions.len(), 1);
    assert_eq!(report.open_transactions[0].transaction_id, transaction_id);
    assert_eq!(engine.document(PROJECTS, project.id).await?, None);

    Ok(())
}

/// Commits a business transaction with a project and one task, then publishes its outbox rows
/// twice, as a relay that stopped before removing them would.
async fn duplicated_transaction<B: Broker + Clone + 'static>(
    store: &Store,
    broker: &B,
) -> Result<(Uuid, Project, Task)> {
    let bus = bus(store);
    let project = Project::new("Artemis");
    let tx = bus.begin_business_transaction(project.id)?;
    let transaction_id = tx.id();

    let project = CommandHandler::create(project)
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    let task = CommandHandler::create(Task::new(&project, "Build rocket"))
        .emit_event(TaskEvent::Created)
        .to(&bus)
        .await?;

    tx.finish().await?;

    let partition = partition_of(project.id, 4);

    for row in store.pending(partition, 100).await? {
        broker
            .publish(row.partition, &row.key, row.payload.as_deref())
            .await?;
    }

    relay(store, broker).await?;

    assert_eq!(broker.end_offset(partition).await?, 8);

    Ok((transaction_id, project, task))
}

pub async fn test_redelivered_transaction_group<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let (transaction_id, project, task) = duplicated_transaction(store, broker).await?;
    let consumer = consumer(engine, broker);

    assert_eq!(consumer.drain().await?, 8);

    let view = engine
        .document(PROJECTS, project.id)
        .await?
        .expect("project document")
        .to_data::<ProjectView>()?;

    assert_eq!(view.title, "Artemis");
    assert!(engine.document(TASKS, task.id).await?.is_some());

    let finished = engine
        .finished("online", transaction_id)
        .await?
        .expect("finished transaction");

    assert_eq!(finished.offset, 3);
    assert_eq!(finished.digests.len(), 4);

    // an event the finished group never held is still rejected
    let mut renamed = project.clone();
    renamed.version += 1;

    let stray = publish(broker, &project_created(&renamed, Some(transaction_id))?).await?;
    let err = consumer.manager().process(&stray).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, Error::UnknownOrOutOfOrderTransaction { .. }));

    Ok(())
}

/// The relay removes rows batch by batch: a crash after the second batch of a group is
/// published publishes only the tail of the group again.
pub async fn test_split_redelivered_transaction<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let bus = bus(store);
    let project = Project::new("Vostok");
    let tx = bus.begin_business_transaction(project.id)?;
    let transaction_id = tx.id();

    let project = CommandHandler::create(project)
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    let task = CommandHandler::create(Task::new(&project, "Orbit"))
        .emit_event(TaskEvent::Created)
        .to(&bus)
        .await?;

    tx.finish().await?;

    let partition = partition_of(project.id, 4);
    let relay = Relay::new(store.clone(), broker.clone())
        .config(Config::builder().partitions(4).relay_batch_size(2).build());

    assert_eq!(relay.feed_batch(partition).await?, 2);

    let tail = store.pending(partition, 100).await?;
    assert_eq!(tail.len(), 2);

    for row in tail.iter() {
        broker
            .publish(row.partition, &row.key, row.payload.as_deref())
            .await?;
    }

    assert_eq!(relay.feed().await?, 2);
    assert_eq!(broker.end_offset(partition).await?, 6);

    let consumer = consumer(engine, broker);
    assert_eq!(consumer.drain().await?, 6);

    assert!(engine.document(PROJECTS, project.id).await?.is_some());
    assert!(engine.document(TASKS, task.id).await?.is_some());
    assert_eq!(engine.offset("online", partition).await?, Some(6));

    let finished = engine
        .finished("online", transaction_id)
        .await?
        .expect("finished transaction");

    assert_eq!(finished.offset, 3);

    Ok(())
}

/// A batch published twice before the group finishes is buffered once.
pub async fn test_duplicate_in_open_transaction<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let bus = bus(store);
    let project = Project::new("Soyuz");
    let tx = bus.begin_business_transaction(project.id)?;
    let transaction_id = tx.id();

    let project = CommandHandler::create(project)
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    CommandHandler::create(Task::new(&project, "Launch"))
        .emit_event(TaskEvent::Created)
        .to(&bus)
        .await?;

    tx.finish().await?;

    let partition = partition_of(project.id, 4);
    let head = store.pending(partition, 2).await?;

    for row in head.iter() {
        broker
            .publish(row.partition, &row.key, row.payload.as_deref())
            .await?;
    }

    relay(store, broker).await?;

    let manager = consumer(engine, broker).manager();
    let records = broker.fetch(partition, 0, 100).await?;
    assert_eq!(records.len(), 6);

    for record in records[..2].iter() {
        assert_eq!(manager.process(record).await?, Outcome::Buffered);
    }

    // Started and PROJECT CREATED again
    for record in records[2..4].iter() {
        assert_eq!(manager.process(record).await?, Outcome::Skipped);
    }

    assert_eq!(engine.buffered("online", transaction_id).await?.len(), 2);
    assert_eq!(manager.process(&records[4]).await?, Outcome::Buffered);
    assert_eq!(manager.process(&records[5]).await?, Outcome::Applied(2));

    Ok(())
}

#[derive(Clone)]
struct Ignore;

#[async_trait]
impl EventHandler for Ignore {
    async fn handle(&self, _record: &Record, _projections: &mut Projections<'_>) -> Result<()> {
        Ok(())
    }
}

/// An event and a tombstone of one delete share their key; both apply inside a transaction.
pub async fn test_tombstone_in_transaction<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let bus = bus(store);

    let project = CommandHandler::create(Project::new("Hermes"))
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    let task = CommandHandler::create(Task::new(&project, "Glide"))
        .emit_event(TaskEvent::Created)
        .to(&bus)
        .await?;

    let tx = bus.begin_business_transaction(project.id)?;
    let transaction_id = tx.id();

    task.clone()
        .to_command_handler()
        .emit_event(TaskEvent::Deleted)
        .emit_tombstone()
        .to(&bus)
        .await?;

    tx.finish().await?;
    relay(store, broker).await?;

    let consumer = Consumer::new(engine.clone(), broker.clone())
        .name("online")
        .registry(
            Registry::new()
                .on("PROJECT", ProjectEvent::Created, ProjectHandler)
                .on("TASK", TaskEvent::Created, TaskHandler)
                .on("TASK", TaskEvent::Deleted, Ignore)
                .on_tombstone("TASK", TaskTombstoneHandler),
        )
        .config(config());

    assert_eq!(consumer.drain().await?, 6);
    assert!(engine.document(PROJECTS, project.id).await?.is_some());
    assert_eq!(engine.document(TASKS, task.id).await?, None);

    let finished = engine
        .finished("online", transaction_id)
        .await?
        .expect("finished transaction");

    assert_eq!(finished.digests.len(), 4);

    // the tombstone and the finish published again are absorbed
    let partition = partition_of(project.id, 4);
    let records = broker.fetch(partition, 0, 100).await?;
    assert!(records[4].payload.is_none());

    for record in records[4..].iter() {
        broker
            .publish(record.partition, &record.key, record.payload.as_deref())
            .await?;
    }

    assert_eq!(consumer.drain().await?, 2);
    assert_eq!(engine.document(TASKS, task.id).await?, None);
    assert_eq!(engine.offset("online", partition).await?, Some(8));

    Ok(())
}

pub async fn test_prune_finished_transactions<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
) -> Result<()> {
    let (transaction_id, project, _) = duplicated_transaction(store, broker).await?;
    let manager = consumer(engine, broker).manager();

    assert_eq!(consumer(engine, broker).drain().await?, 8);
    assert!(engine.finished("online", transaction_id).await?.is_some());

    assert_eq!(manager.prune_finished(Duration::from_secs(3600)).await?, 0);
    assert_eq!(manager.prune_finished(Duration::ZERO).await?, 1);
    assert_eq!(engine.finished("online", transaction_id).await?, None);

    // once pruned, a tail published again without its TransactionStarted is a violation
    let partition = partition_of(project.id, 4);
    let records = broker.fetch(partition, 0, 100).await?;
    let offset = broker
        .publish(partition, &records[2].key, records[2].payload.as_deref())
        .await?;
    let tail = broker.fetch(partition, offset, 1).await?;

    let err = manager.process(&tail[0]).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, Error::UnknownOrOutOfOrderTransaction { .. }));

    Ok(())
}

#[derive(Clone)]
struct Unavailable;

#[async_trait]
impl EventHandler for Unavailable {
    async fn handle(&self, _record: &Record, _projections: &mut Projections<'_>) -> Result<()> {
        Err(anyhow!("projection storage unavailable"))
    }
}

pub async fn test_failed_transaction_apply<
    E: Engine + Clone + 'static,
    B: Broker + Clone + 'static,
>(
    store: &Store,
    broker: &B,
    engine: &E,
    clean: &E,
) -> Result<()> {
    let bus = bus(store);
    let project = Project::new("Gemini");
    let tx = bus.begin_business_transaction(project.id)?;
    let transaction_id = tx.id();

    let project = CommandHandler::create(project)
        .emit_event(ProjectEvent::Created)
        .to(&bus)
        .await?;

    let task = CommandHandler::create(Task::new(&project, "Dock"))
        .emit_event(TaskEvent::Created)
        .to(&bus)
        .await?;

    tx.finish().await?;
    relay(store, broker).await?;

    let partition = partition_of(project.id, 4);
    let records = broker.fetch(partition, 0, 100).await?;
    assert_eq!(records.len(), 4);

    let failing = BusinessTransactionManager::new(
        Box::new(engine.clone()),
        Arc::new(
            Registry::new()
                .on("PROJECT", ProjectEvent::Created, ProjectHandler)
                .on("TASK", TaskEvent::Created, Unavailable),
        ),
        "online",
    );

    for record in records[..3].iter() {
        assert_eq!(failing.process(record).await?, Outcome::Buffered);
    }

    let err = failing.process(&records[3]).await.unwrap_err();

    assert!(!err.is_fatal());
    assert!(matches!(err, Error::Handler { aggregate_type, .. } if aggregate_type == "TASK"));

    assert_eq!(engine.document(PROJECTS, project.id).await?, None);
    assert_eq!(engine.document(TASKS, task.id).await?, None);
    assert_eq!(engine.buffered("online", transaction_id).await?.len(), 3);
    assert_eq!(engine.finished("online", transaction_id).await?, None);
    assert_eq!(
        engine.offset("online", partition).await?,
        Some(records[3].offset)
    );

    let manager = consumer(engine, broker).manager();
    assert_eq!(manager.process(&records[3]).await?, Outcome::Applied(2));

    let manager = consumer(clean, broker).manager();

    for record in records.iter() {
        manager.process(record).await?;
    }

    assert_eq!(all_documents(engine).await?, all_documents(clean).await?);
    assert_eq!(all_documents(engine).await?.len(), 2);

    Ok(())
}
