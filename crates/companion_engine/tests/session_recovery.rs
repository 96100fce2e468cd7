use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use companion_engine::executor::ScriptedRuntime;
use companion_engine::store::{FileStoryStore, FileVisionStore, StoryStore};
use companion_engine::EngineSessionManager;
use serde_json::json;

fn temp_dir(prefix: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}-{unique}"))
}

fn file_manager(runtime: &ScriptedRuntime, root: &Path) -> EngineSessionManager {
    EngineSessionManager::new(
        Arc::new(runtime.clone()),
        Arc::new(FileVisionStore::new(root)),
        Arc::new(FileStoryStore::new(root)),
    )
}

#[tokio::test]
async fn restarted_host_replays_persisted_vision_and_story() {
    let root = temp_dir("companion-engine-recovery");
    let runtime = ScriptedRuntime::companion();

    {
        let manager = file_manager(&runtime, &root);
        let session = manager
            .get_or_create("S1", "char_1", &json!({"name": "Ari"}), &json!({}))
            .await
            .expect("first start");
        let history_len = session.lock().await.ready_events()[0]
            .get("history_len")
            .cloned();
        assert_eq!(history_len, Some(json!(0)));

        let outputs = manager
            .on_world_diff("S1", &json!({"vision": {"tick": 1000}, "tick": 1000}))
            .await
            .expect("world diff");
        assert_eq!(outputs.len(), 2);
        assert_eq!(manager.close_all().await, 1);
    }

    let vision = FileVisionStore::new(&root);
    assert_eq!(vision.tick_of("S1").await.expect("tick"), Some(1000));
    let story = FileStoryStore::new(&root);
    assert_eq!(story.load_history("S1", 10).await.expect("history").len(), 1);

    let manager = file_manager(&runtime, &root);
    let session = manager
        .get_or_create("S1", "char_1", &json!({"name": "Ari"}), &json!({}))
        .await
        .expect("second start");
    {
        let session = session.lock().await;
        let ready = &session.ready_events()[0];
        assert_eq!(ready.get("history_len"), Some(&json!(1)));
        assert_eq!(ready.get("vision_tick"), Some(&json!(1000)));
    }
    assert_eq!(runtime.created(), 2);

    manager.close_all().await;
    assert_eq!(runtime.live(), 0);
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn sessions_do_not_share_persisted_state() {
    let root = temp_dir("companion-engine-isolation");
    let runtime = ScriptedRuntime::companion();
    let manager = file_manager(&runtime, &root);

    for id in ["S1", "S2"] {
        manager
            .get_or_create(id, "char_1", &json!({}), &json!({}))
            .await
            .expect("start");
    }
    manager
        .on_world_diff("S1", &json!({"vision": {}, "tick": 7}))
        .await
        .expect("world diff");

    let story = FileStoryStore::new(&root);
    assert_eq!(story.load_history("S1", 10).await.expect("S1").len(), 1);
    assert!(story.load_history("S2", 10).await.expect("S2").is_empty());
    let vision = FileVisionStore::new(&root);
    assert_eq!(vision.tick_of("S2").await.expect("tick"), None);

    manager.close_all().await;
    std::fs::remove_dir_all(&root).ok();
}
