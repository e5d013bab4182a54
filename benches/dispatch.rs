use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use gasyncio::native::LocalMainContext;
use gasyncio::{EventLoop, LoopConfig, NativeLoop};
use std::cell::Cell;
use std::hint::black_box;
use std::rc::Rc;

const CALLBACKS: usize = 1_000;

fn schedule(event_loop: &EventLoop, counter: &Rc<Cell<usize>>) {
    for _ in 0..CALLBACKS {
        let c = counter.clone();
        event_loop.call_soon(move || c.set(c.get() + 1)).unwrap();
    }
}

fn bench_standalone_dispatch(c: &mut Criterion) {
    let event_loop = EventLoop::new(Rc::new(LocalMainContext::new()), LoopConfig::default());
    let counter = Rc::new(Cell::new(0));

    c.bench_function("standalone_call_soon_1000", |b| {
        b.iter_batched(
            || schedule(&event_loop, &counter),
            |()| event_loop.run_until_complete(async {}).unwrap(),
            BatchSize::SmallInput,
        )
    });
    black_box(counter.get());
}

fn bench_slave_dispatch(c: &mut Criterion) {
    let context = Rc::new(LocalMainContext::new());
    let event_loop = EventLoop::new(context.clone(), LoopConfig::default());
    event_loop.start_slave_loop().unwrap();
    let counter = Rc::new(Cell::new(0));

    c.bench_function("slave_call_soon_1000", |b| {
        b.iter_batched(
            || schedule(&event_loop, &counter),
            |()| {
                while event_loop.bookkeeping().ready > 0 {
                    context.iteration(false);
                }
            },
            BatchSize::SmallInput,
        )
    });
    event_loop.stop_slave_loop().unwrap();
    black_box(counter.get());
}

fn bench_slave_transition(c: &mut Criterion) {
    let event_loop = EventLoop::new(Rc::new(LocalMainContext::new()), LoopConfig::default());
    for i in 0..64u64 {
        event_loop
            .call_later(std::time::Duration::from_secs(60 + i), || {})
            .unwrap();
    }

    c.bench_function("start_stop_slave_64_timers", |b| {
        b.iter(|| {
            event_loop.start_slave_loop().unwrap();
            event_loop.stop_slave_loop().unwrap();
        })
    });
}

criterion_group!(benches, bench_standalone_dispatch, bench_slave_dispatch, bench_slave_transition);
criterion_main!(benches);
