use std::sync::Arc;

use remote_swe_common::{ChatMessage, ContentBlock, ImageSource, MessageType};
use remote_swe_db::{ContentCodec, FsBlobStore, MessageStore, SqliteMessageStore};
use serde_json::json;

fn open_store(dir: &std::path::Path) -> Arc<SqliteMessageStore> {
    let codec = Arc::new(ContentCodec::new(Arc::new(FsBlobStore::new(dir.join("blobs")))));
    Arc::new(
        SqliteMessageStore::open(&dir.join("messages.db"), codec)
            .expect("open store")
            .with_page_size(3),
    )
}

fn tool_use(id: &str) -> ChatMessage {
    ChatMessage::assistant(vec![ContentBlock::ToolUse {
        id: id.to_string(),
        name: "readFile".into(),
        input: json!({ "path": "src/main.rs" }),
    }])
}

fn tool_result(id: &str) -> ChatMessage {
    ChatMessage::user(vec![ContentBlock::ToolResult {
        tool_use_id: id.to_string(),
        content: vec![ContentBlock::text("fn main() {}")],
    }])
}

#[tokio::test]
async fn keys_increase_strictly_and_sort_as_strings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    for i in 0..10 {
        store
            .append(
                "conv",
                &ChatMessage::user(vec![ContentBlock::text(format!("message {i}"))]),
                1,
                MessageType::UserMessage,
                None,
            )
            .await
            .expect("append");
    }

    let history = store.get_history("conv").await.expect("history");
    assert_eq!(history.len(), 10, "pagination must cover every page");
    for pair in history.windows(2) {
        assert!(pair[0].sequence_key < pair[1].sequence_key);
        let a: u64 = pair[0].sequence_key.parse().expect("numeric key");
        let b: u64 = pair[1].sequence_key.parse().expect("numeric key");
        assert!(a < b);
    }
    assert!(history.iter().all(|r| r.sequence_key.len() == 15));
}

#[tokio::test]
async fn pair_gets_adjacent_keys_and_token_counts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let [use_record, result_record] = store
        .append_pair("conv", &tool_use("t1"), &tool_result("t1"), 42)
        .await
        .expect("append pair");

    let use_key: u64 = use_record.sequence_key.parse().expect("key");
    let result_key: u64 = result_record.sequence_key.parse().expect("key");
    assert_eq!(result_key, use_key + 1);
    assert_eq!(use_record.message_type, MessageType::ToolUse);
    assert_eq!(use_record.token_count, 42);
    assert_eq!(result_record.message_type, MessageType::ToolResult);
    assert_eq!(result_record.token_count, 0);
}

#[tokio::test]
async fn concurrent_readers_never_see_half_a_pair() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for i in 0..25 {
                let id = format!("t{i}");
                store
                    .append_pair("conv", &tool_use(&id), &tool_result(&id), 5)
                    .await
                    .expect("append pair");
            }
        })
    };

    let reader = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for _ in 0..25 {
                let history = store.get_history("conv").await.expect("history");
                assert_eq!(history.len() % 2, 0, "observed a partial pair");
                for chunk in history.chunks(2) {
                    assert_eq!(chunk[0].message_type, MessageType::ToolUse);
                    assert_eq!(chunk[1].message_type, MessageType::ToolResult);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.expect("writer");
    reader.await.expect("reader");
    assert_eq!(store.get_history("conv").await.expect("history").len(), 50);
}

#[tokio::test]
async fn token_update_touches_only_its_target_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());

    let first = store
        .append(
            "conv",
            &ChatMessage::user(vec![ContentBlock::text("fix bug")]),
            0,
            MessageType::UserMessage,
            Some("U123"),
        )
        .await
        .expect("append");
    store
        .append_pair("conv", &tool_use("t1"), &tool_result("t1"), 10)
        .await
        .expect("pair");

    store
        .update_token_count("conv", &first.sequence_key, -7)
        .await
        .expect("update");
    let once = store.get_history("conv").await.expect("history");
    store
        .update_token_count("conv", &first.sequence_key, -7)
        .await
        .expect("update again");
    let twice = store.get_history("conv").await.expect("history");

    assert_eq!(once, twice);
    assert_eq!(once[0].token_count, -7);
    assert_eq!(once[1].token_count, 10);
    assert_eq!(once[2].token_count, 0);
}

#[tokio::test]
async fn images_are_stored_as_blob_references() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let png = vec![0x89, 0x50, 0x4e, 0x47];

    let result = ChatMessage::user(vec![ContentBlock::ToolResult {
        tool_use_id: "t1".into(),
        content: vec![ContentBlock::image_bytes("png", png.clone())],
    }]);
    store
        .append_pair("conv", &tool_use("t1"), &result, 1)
        .await
        .expect("pair");

    let history = store.get_history("conv").await.expect("history");
    let ContentBlock::ToolResult { content, .. } = &history[1].content[0] else {
        panic!("expected tool result");
    };
    let ContentBlock::Image {
        source: ImageSource::Blob { key },
        ..
    } = &content[0]
    else {
        panic!("expected offloaded image, got {content:?}");
    };
    assert!(key.starts_with("conv/"));
    assert_eq!(
        std::fs::read(dir.path().join("blobs").join(key)).expect("blob file"),
        png
    );

    let rehydrated = store
        .codec()
        .rehydrate(&history[1].content)
        .await
        .expect("rehydrate");
    assert_eq!(rehydrated, result.content);
}

#[tokio::test]
async fn conversations_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path());
    let hello = ChatMessage::user(vec![ContentBlock::text("hello")]);
    store
        .append("a", &hello, 1, MessageType::UserMessage, None)
        .await
        .expect("append");
    store
        .append("b", &hello, 1, MessageType::UserMessage, None)
        .await
        .expect("append");

    assert_eq!(store.get_history("a").await.expect("history").len(), 1);
    assert!(store.get_history("missing").await.expect("history").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paged_scans_do_not_starve_other_writers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let codec = Arc::new(ContentCodec::new(Arc::new(FsBlobStore::new(dir.path().join("blobs")))));
    let store = Arc::new(
        SqliteMessageStore::open(&dir.path().join("messages.db"), codec)
            .expect("open store")
            .with_page_size(1),
    );

    for i in 0..40 {
        store
            .append(
                "long",
                &ChatMessage::user(vec![ContentBlock::text(format!("line {i}"))]),
                1,
                MessageType::UserMessage,
                None,
            )
            .await
            .expect("append long");
    }

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for i in 0..20 {
                store
                    .append(
                        "other",
                        &ChatMessage::user(vec![ContentBlock::text(format!("other {i}"))]),
                        0,
                        MessageType::UserMessage,
                        None,
                    )
                    .await
                    .expect("append other");
            }
        })
    };

    for _ in 0..10 {
        let history = store.get_history("long").await.expect("history");
        assert_eq!(history.len(), 40);
        let keys: Vec<&str> = history.iter().map(|r| r.sequence_key.as_str()).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
    writer.await.expect("writer");
    assert_eq!(store.get_history("other").await.expect("other").len(), 20);
}
