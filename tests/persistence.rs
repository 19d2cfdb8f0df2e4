mod common;

use common::*;
use swr_cache::persist::EngineImage;
use swr_cache::persist::IMAGE_FORMAT;
use swr_cache::prelude::*;

#[tokio::test]
async fn dump_and_load_preserve_tables() {
    let source = Source::new();
    let engine = engine(&source);
    seed_table(&source, &[1, 2, 3]);
    engine.fetch_query(todos()).await.unwrap();
    engine.put(key(1), "edited".to_string(), Origin::Confirmed);
    engine.remove(&key(3));

    let blob = engine.dump().unwrap();

    let restored = engine_with(&Source::new(), config().build().unwrap());
    restored.load(&blob).unwrap();

    assert_eq!(restored.entity_count(), 2);
    for id in [1, 2] {
        let (a, b) = (engine.get(&key(id)).unwrap(), restored.get(&key(id)).unwrap());
        assert_eq!(a, b);
    }

    let view = restored.lookup(&todos()).unwrap();
    assert_eq!(view.status, QueryStatus::Stale);
    assert_eq!(view.items.len(), 2);
    assert_eq!(view.observers, 0);

    // Versions keep growing from where they were, removed keys included.
    assert_eq!(restored.put(key(1), "again".to_string(), Origin::Confirmed), 3);
    assert_eq!(restored.put(key(3), "back".to_string(), Origin::Confirmed), 2);
}

#[tokio::test]
async fn dump_leaves_speculative_state_out() {
    let source = Source::new();
    let engine = engine(&source);
    seed_table(&source, &[1, 2]);
    engine.fetch_query(todos()).await.unwrap();

    source.hold_writes("batch");
    let task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .mutate(
                    [key(1), key(2), key(9)],
                    |k, _| match k.id() {
                        "1" => Some("speculative".to_string()),
                        "2" => None,
                        _ => Some("created".to_string()),
                    },
                    "batch".to_string(),
                    MutationOptions::default(),
                )
                .await
        })
    };
    wait_for("optimistic step", || engine.pending_mutations() == 1).await;

    let image = engine.image();
    let entities = image
        .entities
        .iter()
        .map(|s| (s.key.clone(), s.data.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        entities,
        vec![(key(1), "todo 1".to_string()), (key(2), "todo 2".to_string())]
    );
    assert!(image.entities.iter().all(|s| s.pending_mutation.is_none()));
    // The speculative write bumped key 1; the image keeps that version so nothing goes backwards.
    assert_eq!(image.entities[0].version, engine.get(&key(1)).unwrap().version);
    assert_eq!(image.queries[0].result_refs, vec![key(1), key(2)]);
    assert!(image.validate().is_ok());

    // A load can't happen under a pending mutation.
    let blob = engine.dump().unwrap();
    assert!(matches!(engine.load(&blob), Err(SyncError::Persistence(_))));

    source.release_write("batch");
    task.await.unwrap().unwrap();

    let restored = engine_with(&Source::new(), config().build().unwrap());
    restored.load(&blob).unwrap();
    assert_eq!(restored.get(&key(1)).unwrap().data, "todo 1");
    assert!(restored.get(&key(9)).is_none());
    assert_eq!(restored.lookup(&todos()).unwrap().items.len(), 2);
    assert!(restored.put(key(9), "x".to_string(), Origin::Confirmed) > 1);
}

#[tokio::test]
async fn load_refuses_observed_queries() {
    let source = Source::new();
    let engine = engine(&source);
    let blob = engine.dump().unwrap();

    let handle = engine.query(todos());
    assert!(matches!(engine.load(&blob), Err(SyncError::Persistence(_))));
    drop(handle);
    assert!(engine.load(&blob).is_ok());
    assert_eq!(engine.query_count(), 0);
}

#[tokio::test]
async fn orphan_references_are_rejected() {
    let engine = engine(&Source::new());
    let image: EngineImage<String> = EngineImage {
        format:   IMAGE_FORMAT,
        entities: vec![],
        retired:  vec![],
        queries:  vec![swr_cache::persist::PersistedQuery {
            descriptor:      todos(),
            result_refs:     vec![key(1)],
            status:          QueryStatus::Fresh,
            last_fetched_at: None,
            error:           None,
            stale_time:      std::time::Duration::from_secs(30),
        }],
    };
    assert!(matches!(engine.restore_image(image), Err(SyncError::Persistence(_))));
    assert!(engine.load(b"definitely not an image").is_err());
}

#[tokio::test]
async fn load_notifies_entity_subscribers() {
    let source = Source::new();
    let engine = engine(&source);
    engine.put(key(1), "a".to_string(), Origin::Confirmed);
    let blob = engine.dump().unwrap();

    let target = engine_with(&Source::new(), config().build().unwrap());
    target.put(key(2), "b".to_string(), Origin::Confirmed);
    let one = Recorder::new(&target, Topic::Entity(key(1)));
    let two = Recorder::new(&target, Topic::Entity(key(2)));

    target.load(&blob).unwrap();
    assert!(matches!(&one.events()[..], [Event::EntityChanged(s)] if s.data == "a"));
    assert!(matches!(&two.events()[..], [Event::EntityRemoved { .. }]));
}
