use bytes::Bytes;
use criterion::{Criterion, criterion_group, criterion_main};
use providers::{
    InMemoryBroker, InMemoryCommunicationProvider, InMemoryStorageProvider, InMemoryStore,
};
use saga::{ActionDescriptor, FnAction, TransactionCoordinator};

type Coordinator = TransactionCoordinator<InMemoryCommunicationProvider, InMemoryStorageProvider>;

async fn participant(
    broker: &InMemoryBroker,
    store: &InMemoryStore,
    name: &str,
    parent: &str,
    dependencies: &[String],
) -> Coordinator {
    let descriptor = ActionDescriptor::builder(name)
        .parent(parent)
        .dependencies(dependencies.iter().cloned())
        .action(FnAction::new(|payload| Ok(payload), |_| Ok(())))
        .build()
        .unwrap();

    let mut coordinator = TransactionCoordinator::new(
        "bench",
        InMemoryCommunicationProvider::new(broker.clone()),
        InMemoryStorageProvider::new(store.clone()),
    );
    coordinator.initialize(descriptor).await.unwrap();
    coordinator
}

async fn run_fan_in(children: usize) {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    let names: Vec<String> = (0..children).map(|i| format!("child{i}")).collect();

    let root = participant(&broker, &store, "root", "", &names).await;
    let mut participants = Vec::with_capacity(children);
    for name in &names {
        participants.push(participant(&broker, &store, name, "root", &[]).await);
    }

    root.start(Bytes::from_static(b"payload")).await.unwrap();

    root.close().await.unwrap();
    for participant in participants {
        participant.close().await.unwrap();
    }
}

fn bench_single_action(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("coordinator/single_action", |b| {
        b.iter(|| rt.block_on(run_fan_in(0)));
    });
}

fn bench_fan_in_4(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("coordinator/fan_in_4", |b| {
        b.iter(|| rt.block_on(run_fan_in(4)));
    });
}

fn bench_fan_in_16(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("coordinator/fan_in_16", |b| {
        b.iter(|| rt.block_on(run_fan_in(16)));
    });
}

criterion_group!(benches, bench_single_action, bench_fan_in_4, bench_fan_in_16);
criterion_main!(benches);
