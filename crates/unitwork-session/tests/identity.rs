//! Identity map, lifecycle states and lazy loading.

mod common;

use asupersync::Cx;
use common::*;
use std::sync::Arc;
use unitwork_core::{SessionErrorKind, Value, read_lock, write_lock};
use unitwork_session::{ElementState, EntityStatus, Query, Session, SessionConfig};

#[test]
fn repeated_get_returns_the_same_instance() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let a = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let b = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(db.statements("SELECT").len(), 1);
        assert_eq!(session.stats().entities_loaded, 1);
    });
}

#[test]
fn int_and_bigint_ids_name_the_same_row() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let a = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let b = unwrap_outcome(session.find::<Team>(&cx, vec![Value::Int(1)]).await)
            .expect("team");
        assert!(Arc::ptr_eq(&a, &b));
    });
}

#[test]
fn query_results_go_through_the_identity_map() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    seed_team(&db, 2, "Defenders", 0);
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let loaded = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        write_lock(&loaded).name = "Unsaved".to_string();

        let teams = unwrap_outcome(
            session
                .query::<Team>(&cx, Query::new(r#"SELECT "id", "name", "version" FROM "teams""#))
                .await,
        );
        assert_eq!(teams.len(), 2);
        let same = teams
            .iter()
            .find(|t| read_lock(t).id == 1)
            .expect("team 1");
        assert!(Arc::ptr_eq(same, &loaded));
        // The row never overwrites the managed instance.
        assert_eq!(read_lock(same).name, "Unsaved");
    });
}

#[test]
fn missing_row_is_none() {
    let db = FakeDb::new();
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        assert!(unwrap_outcome(session.get::<Team>(&cx, 99_i64).await).is_none());
    });
}

#[test]
fn get_reference_only_consults_the_identity_map() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db.clone());

    assert!(session.get_reference::<Team>(1_i64).is_none());
    block_on(async {
        let cx = Cx::for_testing();
        let team = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let reference = session.get_reference::<Team>(1_i64).expect("managed");
        assert!(Arc::ptr_eq(&team, &reference));
    });
}

#[test]
fn persisting_a_second_instance_with_a_managed_key_fails() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        let _managed = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let twin = team(1, "Impostors");

        let err = session.persist(&twin).expect_err("duplicate identity");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::NonUniqueObject));
        assert_eq!(session.status(&twin), EntityStatus::Detached);
    });
}

#[test]
fn lifecycle_statuses() {
    let db = FakeDb::new();
    let mut session = Session::new(db);
    let t = team(1, "Avengers");
    assert_eq!(session.status(&t), EntityStatus::Transient);

    session.persist(&t).expect("persist");
    assert_eq!(session.status(&t), EntityStatus::Managed);
    assert!(session.contains(&t));

    session.remove(&t).expect("remove");
    assert_eq!(session.status(&t), EntityStatus::Removed);
    assert!(!session.contains(&t));
    // Never inserted, so nothing is left to do.
    assert!(session.pending_counts().is_empty());

    session.persist(&t).expect("persist again");
    assert_eq!(session.status(&t), EntityStatus::Managed);
    assert_eq!(session.pending_counts().insertions, 1);
}

#[test]
fn evicted_instances_are_detached() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        session.evict(&t).expect("evict");

        assert_eq!(session.status(&t), EntityStatus::Detached);
        let err = session.persist(&t).expect_err("detached persist");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::Detached));
        let err = session.remove(&t).expect_err("detached remove");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::Detached));

        // Changes to a detached instance are not tracked.
        write_lock(&t).name = "Ignored".to_string();
        let stats = unwrap_outcome(session.flush(&cx).await);
        assert!(stats.is_empty());

        // A fresh load yields a new managed instance.
        let again = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        assert!(!Arc::ptr_eq(&t, &again));
        assert_eq!(read_lock(&again).name, "Avengers");
    });
}

#[test]
fn evict_drops_pending_insert() {
    let db = FakeDb::new();
    let mut session = Session::new(db.clone());
    let t = team(1, "Avengers");
    session.persist(&t).expect("persist");
    session.evict(&t).expect("evict");

    assert_eq!(session.status(&t), EntityStatus::Transient);
    block_on(async {
        let cx = Cx::for_testing();
        unwrap_outcome(session.flush(&cx).await);
    });
    assert_eq!(db.count("teams"), 0);
}

#[test]
fn removing_a_transient_instance_does_nothing() {
    let db = FakeDb::new();
    let mut session = Session::new(db);
    let t = team(5, "Nobody");
    session.remove(&t).expect("no-op");
    assert_eq!(session.status(&t), EntityStatus::Transient);
    assert!(session.pending_counts().is_empty());
}

#[test]
fn removed_entity_is_invisible_to_get() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        session.remove(&t).expect("remove");
        assert!(unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).is_none());
        assert!(session.get_reference::<Team>(1_i64).is_none());
    });
}

#[test]
fn initialize_collection_reuses_managed_elements() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    seed_hero(&db, 10, "Thor", Some(1));
    seed_hero(&db, 11, "Hulk", Some(1));
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let thor = unwrap_outcome(session.get::<Hero>(&cx, 10_i64).await).expect("hero");
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        assert!(!read_lock(&t).heroes.is_initialized());

        db.clear_log();
        let heroes =
            unwrap_outcome(session.initialize_collection::<Team, Hero>(&cx, &t, "heroes").await);
        assert_eq!(heroes.len(), 2);
        assert!(heroes.iter().any(|h| Arc::ptr_eq(h, &thor)));
        assert!(read_lock(&t).heroes.is_initialized());
        assert_eq!(read_lock(&t).heroes.len(), 2);

        // One key query plus one IN-list load for the hero not yet managed.
        let log = db.log();
        assert_eq!(log.len(), 2);
        assert!(log[1].contains(r#""id" IN ($1)"#));

        // Already initialized: no SQL.
        db.clear_log();
        let again =
            unwrap_outcome(session.initialize_collection::<Team, Hero>(&cx, &t, "heroes").await);
        assert_eq!(again.len(), 2);
        assert!(db.log().is_empty());
    });
}

#[test]
fn initialize_collection_rejects_unknown_roles() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let err =
            expect_err(session.initialize_collection::<Team, Hero>(&cx, &t, "villains").await);
        assert_eq!(err.session_kind(), Some(SessionErrorKind::UnknownAssociation));
    });
}

#[test]
fn resolve_loads_a_to_one_once() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    seed_hero(&db, 10, "Thor", Some(1));
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let thor = unwrap_outcome(session.get::<Hero>(&cx, 10_i64).await).expect("hero");
        assert!(!read_lock(&thor).team.is_resolved());

        let t = unwrap_outcome(session.resolve::<Hero, Team>(&cx, &thor, "team").await)
            .expect("team");
        assert!(read_lock(&thor).team.is_resolved());
        let managed = session.get_reference::<Team>(1_i64).expect("managed");
        assert!(Arc::ptr_eq(&t, &managed));

        db.clear_log();
        let again = unwrap_outcome(session.resolve::<Hero, Team>(&cx, &thor, "team").await)
            .expect("team");
        assert!(Arc::ptr_eq(&t, &again));
        assert!(db.log().is_empty());
    });
}

#[test]
fn resolve_reports_missing_target_row() {
    let db = FakeDb::new();
    seed_hero(&db, 10, "Thor", Some(7));
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        let thor = unwrap_outcome(session.get::<Hero>(&cx, 10_i64).await).expect("hero");
        let err = expect_err(session.resolve::<Hero, Team>(&cx, &thor, "team").await);
        assert_eq!(err.session_kind(), Some(SessionErrorKind::ObjectNotFound));
    });
}

#[test]
fn association_state_tracks_disassociation() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    seed_hero(&db, 10, "Thor", Some(1));
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let heroes =
            unwrap_outcome(session.initialize_collection::<Team, Hero>(&cx, &t, "heroes").await);
        let thor = Arc::clone(&heroes[0]);
        let newcomer = hero(12, "Vision");

        assert_eq!(
            session.association_state(&t, "heroes", &thor).expect("state"),
            ElementState::Associated
        );
        assert_eq!(
            session.association_state(&t, "heroes", &newcomer).expect("state"),
            ElementState::NotYetAssociated
        );

        write_lock(&t).heroes.remove(&thor);
        assert_eq!(
            session.association_state(&t, "heroes", &thor).expect("state"),
            ElementState::DisassociatedPendingRemoval
        );

        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            session.association_state(&t, "heroes", &thor).expect("state"),
            ElementState::Removed
        );
    });
}

#[test]
fn unresolved_to_one_counts_as_associated() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    seed_hero(&db, 10, "Thor", Some(1));
    let mut session = Session::new(db);

    block_on(async {
        let cx = Cx::for_testing();
        let thor = unwrap_outcome(session.get::<Hero>(&cx, 10_i64).await).expect("hero");
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        assert_eq!(
            session.association_state(&thor, "team", &t).expect("state"),
            ElementState::Associated
        );
        let err = session
            .association_state(&thor, "sidekick", &t)
            .expect_err("unknown role");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::UnknownAssociation));
    });
}

#[test]
fn initialize_collection_loads_elements_in_batches() {
    let db = FakeDb::new();
    seed_team(&db, 1, "Avengers", 0);
    seed_hero(&db, 10, "Thor", Some(1));
    seed_hero(&db, 11, "Hulk", Some(1));
    seed_hero(&db, 12, "Wasp", Some(1));
    let mut session =
        Session::with_config(db.clone(), SessionConfig::new().with_batch_size(2));

    block_on(async {
        let cx = Cx::for_testing();
        let t = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");

        db.clear_log();
        let heroes =
            unwrap_outcome(session.initialize_collection::<Team, Hero>(&cx, &t, "heroes").await);
        assert_eq!(heroes.len(), 3);

        let log = db.log();
        assert_eq!(log.len(), 3);
        assert!(log[1].contains(r#""id" IN ($1, $2)"#));
        assert!(log[2].contains(r#""id" IN ($1)"#));
        assert_eq!(session.stats().entities_loaded, 4);
    });
}

fn fire() -> Vec<Value> {
    vec![Value::Text("Fire".to_string())]
}

#[test]
fn natural_id_lookup_is_answered_from_the_session() {
    let db = FakeDb::new();
    seed_power(&db, 1, "Fire");
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let first = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("power");
        assert_eq!(read_lock(&first).id, 1);
        assert_eq!(
            db.statements("SELECT"),
            vec![r#"SELECT "id", "name" FROM "powers" WHERE "name" = $1"#.to_string()]
        );

        db.clear_log();
        let second = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("power");
        assert!(Arc::ptr_eq(&first, &second));
        let by_id = unwrap_outcome(session.get::<Power>(&cx, 1_i64).await).expect("power");
        assert!(Arc::ptr_eq(&first, &by_id));
        assert!(db.log().is_empty());
        assert_eq!(session.stats().natural_id_hits, 1);

        let unknown = vec![Value::Text("Ice".to_string())];
        assert!(unwrap_outcome(session.find_by_natural_id::<Power>(&cx, unknown).await).is_none());
    });
}

#[test]
fn natural_ids_are_indexed_on_load_and_persist() {
    let db = FakeDb::new();
    seed_power(&db, 1, "Fire");
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let loaded = unwrap_outcome(session.get::<Power>(&cx, 1_i64).await).expect("power");
        let ice = power(2, "Ice");
        session.persist(&ice).expect("persist");

        db.clear_log();
        let found = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("fire");
        assert!(Arc::ptr_eq(&found, &loaded));
        let ice_name = vec![Value::Text("Ice".to_string())];
        let found = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, ice_name).await)
            .expect("ice");
        assert!(Arc::ptr_eq(&found, &ice));
        assert!(db.log().is_empty());
        assert_eq!(session.pending_counts().insertions, 1);
    });
}

#[test]
fn evicted_or_removed_entities_are_looked_up_again() {
    let db = FakeDb::new();
    seed_power(&db, 1, "Fire");
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let first = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("power");
        session.evict(&first).expect("evict");

        db.clear_log();
        let reloaded = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("power");
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(db.statements("SELECT").len(), 1);

        session.remove(&reloaded).expect("remove");
        db.clear_log();
        assert!(unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await).is_none());
        // The pending delete is flushed before the lookup query.
        let log = db.log();
        assert!(log[0].starts_with(r#"DELETE FROM "powers""#));
        assert!(log.last().is_some_and(|sql| sql.starts_with("SELECT")));
    });
    assert!(db.row("powers", 1).is_none());
}

#[test]
fn renamed_natural_id_is_reindexed_by_flush() {
    let db = FakeDb::new();
    seed_power(&db, 1, "Fire");
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let p = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("power");
        write_lock(&p).name = "Flame".to_string();

        let flame = vec![Value::Text("Flame".to_string())];
        let found = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, flame.clone()).await)
            .expect("renamed power");
        assert!(Arc::ptr_eq(&found, &p));
        assert_eq!(session.stats().auto_flushes, 1);

        assert!(unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await).is_none());

        db.clear_log();
        let again = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, flame).await)
            .expect("renamed power");
        assert!(Arc::ptr_eq(&again, &p));
        assert!(db.log().is_empty());
    });
}

#[test]
fn natural_id_lookup_needs_declared_columns() {
    let db = FakeDb::new();
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let name = vec![Value::Text("Avengers".to_string())];
        let err = expect_err(session.find_by_natural_id::<Team>(&cx, name).await);
        assert_eq!(err.session_kind(), Some(SessionErrorKind::MissingIdentifier));

        let err = expect_err(session.find_by_natural_id::<Power>(&cx, Vec::new()).await);
        assert_eq!(err.session_kind(), Some(SessionErrorKind::MissingIdentifier));
        assert!(db.log().is_empty());
    });
}

#[test]
fn rescued_entity_is_found_by_natural_id_again() {
    let db = FakeDb::new();
    seed_power(&db, 1, "Fire");
    let mut session = Session::new(db.clone());

    block_on(async {
        let cx = Cx::for_testing();
        let p = unwrap_outcome(session.get::<Power>(&cx, 1_i64).await).expect("power");
        session.remove(&p).expect("remove");
        session.persist(&p).expect("rescue");

        db.clear_log();
        let found = unwrap_outcome(session.find_by_natural_id::<Power>(&cx, fire()).await)
            .expect("power");
        assert!(Arc::ptr_eq(&found, &p));
        assert!(db.log().is_empty());
    });
}
