//! PostgreSQL-backed tests. They need a database with the `vector` and
//! `pgroonga` extensions available:
//!
//! ```bash
//! TELEMIKIYA_TEST_DATABASE_URL=postgres://localhost/telemikiya_test \
//!     cargo test --test postgres -- --ignored --test-threads=1
//! ```
//!
//! Every test drops and recreates the `dialog` and `message` tables.

use chrono::{TimeZone, Utc};

use telemikiya::config::Config;
use telemikiya::db;
use telemikiya::migrate::run_migrations;
use telemikiya::pg_store::PgStore;
use telemikiya_core::media::{MediaInfo, Photo};
use telemikiya_core::models::{Dialog, DialogType, InsertOutcome, NewMessage, SearchFilter};
use telemikiya_core::store::Store;
use telemikiya_core::Error;

fn config(dims: usize) -> Config {
    let url = std::env::var("TELEMIKIYA_TEST_DATABASE_URL")
        .expect("TELEMIKIYA_TEST_DATABASE_URL must be set for postgres tests");
    toml::from_str(&format!(
        "[database]\nurl = \"{}\"\n[embedding]\ndims = {}\n",
        url, dims
    ))
    .unwrap()
}

async fn fresh_store(dims: usize) -> PgStore {
    let cfg = config(dims);
    let pool = db::connect(&cfg).await.unwrap();
    sqlx::query("DROP TABLE IF EXISTS message, dialog")
        .execute(&pool)
        .await
        .unwrap();
    run_migrations(&cfg, false).await.unwrap();
    PgStore::new(pool)
}

fn dialog(id: i64) -> Dialog {
    Dialog {
        id,
        title: "Test".into(),
        dialog_type: DialogType::Group,
        updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn new_message(msg_id: i32, text: &str) -> NewMessage {
    NewMessage {
        msg_id,
        dialog_id: -5,
        text: text.into(),
        media_info: MediaInfo::None,
        sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, msg_id as u32).unwrap(),
    }
}

#[tokio::test]
#[ignore]
async fn test_migrate_is_idempotent() {
    let _store = fresh_store(4).await;
    let report = run_migrations(&config(4), false).await.unwrap();
    assert_eq!(report.statements, 0);
    assert_eq!(report.cleared_embeddings, 0);
}

#[tokio::test]
#[ignore]
async fn test_dimension_change_requires_consent() {
    let store = fresh_store(4).await;
    store.create_dialog(&dialog(-5)).await.unwrap();
    let InsertOutcome::Inserted(id) = store.insert_message(&new_message(1, "hi")).await.unwrap()
    else {
        panic!("expected insert");
    };
    store
        .set_text_embedding(id, &[1.0, 0.0, 0.0, 0.0])
        .await
        .unwrap();

    let err = run_migrations(&config(8), false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::NotAllowedToClearEmbedding { .. })
    ));
    assert!(store.pending_embeddings(10).await.unwrap().is_empty());

    let report = run_migrations(&config(8), true).await.unwrap();
    assert_eq!(report.cleared_embeddings, 1);
    assert_eq!(store.pending_embeddings(10).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_store_roundtrip_and_search() {
    let store = fresh_store(4).await;
    store.create_dialog(&dialog(-5)).await.unwrap();
    assert!(matches!(
        store.create_dialog(&dialog(-5)).await.unwrap_err().downcast_ref::<Error>(),
        Some(Error::DialogExists(-5))
    ));

    let mut photo = new_message(1, "hello world");
    photo.media_info = MediaInfo::Photo(Photo {
        id: 1,
        access_hash: 2,
        file_reference_base64: "AQI=".into(),
    });
    let InsertOutcome::Inserted(hello) = store.insert_message(&photo).await.unwrap() else {
        panic!("expected insert");
    };
    assert_eq!(
        store.insert_message(&photo).await.unwrap(),
        InsertOutcome::Duplicate
    );
    let InsertOutcome::Inserted(bye) = store
        .insert_message(&new_message(2, "goodbye world"))
        .await
        .unwrap()
    else {
        panic!("expected insert");
    };

    let pending = store.pending_embeddings(10).await.unwrap();
    assert_eq!(pending.iter().map(|p| p.id).collect::<Vec<_>>(), vec![hello, bye]);

    store.set_text_embedding(hello, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    store.set_text_embedding(bye, &[0.0, 1.0, 0.0, 0.0]).await.unwrap();

    let filter = SearchFilter::default();
    let semantic = store
        .semantic_search(&[1.0, 0.1, 0.0, 0.0], 2, None, &filter)
        .await
        .unwrap();
    assert_eq!(semantic[0].message.id, hello);
    assert_eq!(semantic[0].rank, 1);
    assert!(semantic[0].message.has_media);

    let lexical = store.lexical_search("hello", 2, &filter).await.unwrap();
    assert_eq!(lexical[0].message.id, hello);
    assert_eq!(lexical[0].rank, 1);
    assert!(store.lexical_search("  ", 2, &filter).await.unwrap().is_empty());

    let excluded = SearchFilter {
        exclude_dialog_id: Some(-5),
        ..Default::default()
    };
    assert!(store
        .semantic_search(&[1.0, 0.0, 0.0, 0.0], 2, None, &excluded)
        .await
        .unwrap()
        .is_empty());
}
