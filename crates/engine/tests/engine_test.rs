//! Integration tests for local scheduling and the engine lifecycle
//!
//! Tests include:
//! - Handler failure isolation
//! - Init event delivery
//! - Polled event sources
//! - Priority and interval scheduling
//! - Graceful drain on stop
//! - Transport failures at activation and at runtime
//! - Shutdown under broadcast load

mod common;
use common::{ScriptedTransport, TEST_TIMEOUT, broker, collect, networked, next, shutdown, spawn};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use evsched_engine::{Engine, EngineState, Error, Event, Trigger, source_fn, topics};
use evsched_transport_memory::MemoryBroker;
use pretty_assertions::assert_eq;
use serde_json::json;

// ============= Local Dispatch Tests =============

#[tracing_test::traced_test]
#[tokio::test]
async fn test_failing_handler_does_not_stop_engine() {
    let builder = Engine::builder("isolated")
        .on_event("crash", |_ctx, _event| async {
            Err::<(), _>(anyhow::anyhow!("handler bug"))
        });
    let (builder, mut pings) = collect(builder, "ping");
    let engine = builder.build().unwrap();
    let running = spawn(&engine);

    engine.submit(Event::new("crash", json!({"qty": -1})).unwrap());
    engine.submit(Event::new("ping", json!(1)).unwrap());

    assert_eq!(next(&mut pings).await.payload(), &json!(1));
    assert_eq!(engine.state(), EngineState::Active);

    shutdown(&engine, running).await;
}

#[tokio::test]
async fn test_init_event_addressed_to_engine() {
    let (builder, mut inits) = collect(Engine::builder("bootstrap"), topics::INIT);
    let engine = builder.build().unwrap();
    let running = spawn(&engine);

    let init = next(&mut inits).await;

    assert_eq!(init.channel(), "bootstrap");
    shutdown(&engine, running).await;
}

#[tokio::test]
async fn test_source_events_are_dispatched() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    let feed = source_fn("ticker-feed", move |_ctx| {
        let poll = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if poll < 3 {
                anyhow::Ok(vec![Event::new("quote", json!(poll))?])
            } else {
                anyhow::Ok(vec![])
            }
        }
    });
    let (builder, mut quotes) = collect(Engine::builder("sourced").with_source(feed), "quote");
    let engine = builder.build().unwrap();
    let running = spawn(&engine);

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next(&mut quotes).await.payload().clone());
    }
    seen.sort_by_key(|value| value.as_u64());

    assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
    shutdown(&engine, running).await;
}

#[tokio::test]
async fn test_lower_priority_number_dispatched_first() {
    let (builder, mut seen) = collect(Engine::builder("ordered").with_max_workers(1), "job");
    let engine = builder.build().unwrap();

    // Both become eligible at the same instant; only priority separates them.
    let at = Utc::now() + TimeDelta::milliseconds(200);
    for (label, priority) in [("routine", 50), ("urgent", 1)] {
        engine.submit(
            Event::builder("job")
                .payload(label)
                .priority(priority)
                .trigger(Trigger::once_at(at))
                .build()
                .unwrap(),
        );
    }
    let running = spawn(&engine);

    assert_eq!(next(&mut seen).await.payload(), &json!("urgent"));
    assert_eq!(next(&mut seen).await.payload(), &json!("routine"));

    shutdown(&engine, running).await;
}

#[tokio::test]
async fn test_interval_fires_on_fixed_grid() {
    let (builder, mut ticks) = collect(Engine::builder("metronome"), "tick");
    let engine = builder.build().unwrap();
    let running = spawn(&engine);

    let period = Duration::from_millis(100);
    let tick = Event::builder("tick")
        .trigger(Trigger::interval(period).unwrap())
        .build()
        .unwrap();
    let id = tick.id();
    engine.submit(tick);

    let mut fires = Vec::new();
    for _ in 0..5 {
        let fired = next(&mut ticks).await;
        assert_eq!(fired.id(), id);
        fires.push(fired.trigger().and_then(Trigger::last_fire).unwrap());
    }

    let step = TimeDelta::from_std(period).unwrap();
    for pair in fires.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= step, "fires closer than the period: {gap}");
        assert_eq!(
            gap.num_milliseconds() % step.num_milliseconds(),
            0,
            "fire left the grid"
        );
    }

    shutdown(&engine, running).await;
}

#[tokio::test]
async fn test_one_second_interval_cadence() {
    let (builder, mut ticks) = collect(Engine::builder("clock"), "second");
    let engine = builder.build().unwrap();
    let running = spawn(&engine);

    engine.submit(
        Event::builder("second")
            .trigger(Trigger::interval(Duration::from_secs(1)).unwrap())
            .build()
            .unwrap(),
    );

    let window = tokio::time::sleep(Duration::from_millis(5200));
    tokio::pin!(window);
    let mut fires = 0;
    loop {
        tokio::select! {
            () = &mut window => break,
            Some(_) = ticks.recv() => fires += 1,
        }
    }

    assert!(fires >= 4, "only {fires} fires in five seconds");
    shutdown(&engine, running).await;
}

// ============= Lifecycle Tests =============

#[tokio::test]
async fn test_stop_waits_for_in_flight_handlers() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (started.clone(), finished.clone());

    let engine = Engine::builder("draining")
        .on_event("slow", move |_ctx, _event| {
            let (s, f) = (s.clone(), f.clone());
            async move {
                s.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                f.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    let running = spawn(&engine);

    engine.submit(Event::new("slow", json!(null)).unwrap());
    common::wait_for(|| started.load(Ordering::SeqCst)).await;

    shutdown(&engine, running).await;

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_stopped_engine_is_not_restartable() {
    let engine = Engine::builder("one-shot").build().unwrap();
    let running = spawn(&engine);

    common::wait_for(|| engine.state() == EngineState::Active).await;
    shutdown(&engine, running).await;

    assert!(matches!(
        engine.activate().await,
        Err(Error::InvalidState { .. })
    ));
    assert!(!engine.submit(Event::new("late", json!(null)).unwrap()));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_fatal() {
    let engine = Engine::builder("stranded")
        .with_endpoint("memory://no-broker-here")
        .with_transport(evsched_transport_memory::MemoryTransport::new())
        .build()
        .unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, engine.start())
        .await
        .unwrap();

    assert!(matches!(result, Err(Error::TransportFatal(_))));
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_refused_connection_is_fatal() {
    let engine = Engine::builder("refused")
        .with_endpoint("scripted://refused")
        .with_transport(ScriptedTransport::refusing())
        .build()
        .unwrap();

    assert!(matches!(
        engine.activate().await,
        Err(Error::TransportFatal(_))
    ));
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_broker_shutdown_leaves_engine_stoppable() {
    let broker = broker("vanishing");
    let (builder, mut inits) = collect(networked("survivor", &broker), topics::INIT);
    let engine = builder.build().unwrap();
    let running = spawn(&engine);
    next(&mut inits).await;

    broker.shutdown();
    common::wait_for(|| engine.context().is_transport_lost()).await;

    assert_eq!(engine.state(), EngineState::Active);
    assert!(!engine.publish(Event::new("after-loss", json!(null)).unwrap()));
    assert!(engine.submit(Event::new("local", json!(null)).unwrap()));
    shutdown(&engine, running).await;
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_stop_under_broadcast_flood() {
    let endpoint = format!("memory://flood-{}", uuid::Uuid::new_v4());
    let config = evsched_transport::Config {
        inbox_capacity: 8,
        ..evsched_transport::Config::default()
    };
    let broker = MemoryBroker::bind_with_config(endpoint, config).unwrap();

    let chatty = |name: &str| {
        networked(name, &broker)
            .on_event(topics::INIT, |ctx, _event| async move {
                for i in 0..200 {
                    ctx.publish(
                        Event::builder("chatter")
                            .payload(i)
                            .channel(topics::BROADCAST)
                            .build()?,
                    );
                }
                anyhow::Ok(())
            })
            .on_event("chatter", |_ctx, _event| async { Ok(()) })
            .build()
            .unwrap()
    };
    let (a, b) = (chatty("alpha"), chatty("beta"));
    let (ra, rb) = (spawn(&a), spawn(&b));
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(TEST_TIMEOUT, async {
        shutdown(&a, ra).await;
        shutdown(&b, rb).await;
    })
    .await
    .expect("Engines did not stop under load");

    assert_eq!(a.state(), EngineState::Stopped);
    assert_eq!(b.state(), EngineState::Stopped);
    broker.shutdown();
}

// ============= Inbound Classification Tests =============

#[tracing_test::traced_test]
#[tokio::test]
async fn test_malformed_frame_dropped() {
    let transport = ScriptedTransport::new();
    let (builder, mut pings) = collect(
        Engine::builder("tolerant")
            .with_endpoint("scripted://bus")
            .with_transport(transport.clone()),
        "ping",
    );
    let engine = builder.build().unwrap();

    transport.feed(vec![0xFF, 0x00, 0x13]);
    transport.feed(
        evsched_event::codec::encode(&Event::new("ping", json!("after garbage")).unwrap())
            .unwrap(),
    );
    let running = spawn(&engine);

    assert_eq!(next(&mut pings).await.payload(), &json!("after garbage"));
    assert_eq!(engine.state(), EngineState::Active);

    shutdown(&engine, running).await;
}

#[tokio::test]
async fn test_subscribes_to_name_broadcast_and_token() {
    let transport = ScriptedTransport::new();
    let engine = Engine::builder("listener")
        .with_endpoint("scripted://bus")
        .with_transport(transport.clone())
        .build()
        .unwrap();

    engine.activate().await.unwrap();

    assert_eq!(
        transport.subscriptions(),
        ["listener", topics::BROADCAST, engine.token()]
    );
    engine.stop().await;
}

#[tokio::test]
async fn test_request_to_foreign_token_dropped() {
    let transport = ScriptedTransport::new();
    let (builder, mut pings) = collect(
        Engine::builder("picky")
            .with_endpoint("scripted://bus")
            .with_transport(transport.clone())
            .rpc_method("add", evsched_engine::typed(|(a, b): (i64, i64)| Ok(a + b))),
        "ping",
    );
    let engine = builder.build().unwrap();

    let stray = Event::builder("add")
        .payload(json!([1, 2]))
        .channel("rpc_somebody_else")
        .reply_to("rpc_caller")
        .build()
        .unwrap();
    transport.feed(evsched_event::codec::encode(&stray).unwrap());
    transport.feed(evsched_event::codec::encode(&Event::new("ping", json!(null)).unwrap()).unwrap());
    let running = spawn(&engine);

    next(&mut pings).await;
    shutdown(&engine, running).await;

    assert!(
        transport.sent().iter().all(|event| event.channel() != "rpc_caller"),
        "stray request was answered"
    );
}
