use tokio::io::AsyncWriteExt;

use super::{create_cache, journal_contents, live_keys, read_entry, set_entry, with_temp_dir};

#[tokio::test]
async fn oldest_entry_is_evicted_when_over_size() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, _scheduler) = create_cache(&dir, 10).await;

            set_entry(&cache, "a", &["a", "aaa"]).await; // size 4
            set_entry(&cache, "b", &["bb", "bbbb"]).await; // size 10
            set_entry(&cache, "c", &["c", "c"]).await; // size 12, over the cap

            cache.flush().await.expect("flush should not fail");

            assert!(read_entry(&cache, "a").await.is_none());
            assert!(read_entry(&cache, "b").await.is_some());
            assert!(read_entry(&cache, "c").await.is_some());
            assert_eq!(8, cache.size().await.expect("size should not fail"));
        }
    })
    .await;
}

#[tokio::test]
async fn reads_protect_entries_from_eviction() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, _scheduler) = create_cache(&dir, 10).await;

            for key in ["a", "b", "c", "d", "e"] {
                set_entry(&cache, key, &[key, key]).await; // size 2 each
            }
            assert_eq!(10, cache.size().await.expect("size should not fail"));

            // Promote "b" so the next evictions pass over it.
            let snapshot = cache
                .get("b")
                .await
                .expect("get should not fail")
                .expect("entry should exist");
            snapshot.close().await;

            set_entry(&cache, "f", &["f", "f"]).await;
            cache.flush().await.expect("flush should not fail");
            set_entry(&cache, "g", &["g", "g"]).await;
            cache.flush().await.expect("flush should not fail");

            for key in ["a", "c"] {
                assert!(read_entry(&cache, key).await.is_none(), "{key} should be evicted");
            }
            for key in ["b", "d", "e", "f", "g"] {
                assert!(read_entry(&cache, key).await.is_some(), "{key} should survive");
            }
            assert_eq!(10, cache.size().await.expect("size should not fail"));
        }
    })
    .await;
}

#[tokio::test]
async fn commit_schedules_background_trim() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, scheduler) = create_cache(&dir, 4).await;

            set_entry(&cache, "a", &["aa", "bb"]).await; // exactly at the cap
            assert_eq!(0, scheduler.pending());

            set_entry(&cache, "b", &["cc", "dd"]).await; // now over it
            assert_eq!(1, scheduler.pending());

            // Nothing is evicted until the maintenance task actually runs.
            assert_eq!(8, cache.size().await.expect("size should not fail"));
            scheduler.run_pending().await;
            assert_eq!(4, cache.size().await.expect("size should not fail"));
            assert!(read_entry(&cache, "a").await.is_none());
            assert!(read_entry(&cache, "b").await.is_some());
        }
    })
    .await;
}

#[tokio::test]
async fn trim_skips_entries_being_edited() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, scheduler) = create_cache(&dir, 4).await;

            set_entry(&cache, "busy", &["xx", "yy"]).await;
            let mut editor = cache
                .edit("busy")
                .await
                .expect("edit should not fail")
                .expect("editor should be available");

            // Push the cache over its cap while "busy", the oldest entry, is mid-edit.
            set_entry(&cache, "young", &["aa", "bb"]).await;
            scheduler.run_pending().await;

            // The editor shielded "busy", so the newer entry was evicted instead.
            assert!(read_entry(&cache, "young").await.is_none());

            let mut sink = editor.new_sink(0).await.expect("sink should open");
            sink.write_all(b"z").await.expect("write should not fail");
            sink.shutdown().await.expect("shutdown should not fail");
            editor.commit().await.expect("commit should not fail");
            scheduler.run_pending().await;

            assert_eq!(
                Some(vec!["z".to_string(), "yy".to_string()]),
                read_entry(&cache, "busy").await
            );
        }
    })
    .await;
}

#[tokio::test]
async fn set_max_size_takes_effect_on_next_trim() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, scheduler) = create_cache(&dir, 100).await;

            set_entry(&cache, "a", &["aa", "aa"]).await;
            set_entry(&cache, "b", &["bb", "bb"]).await;
            set_entry(&cache, "c", &["cc", "cc"]).await;
            assert_eq!(12, cache.size().await.expect("size should not fail"));

            cache.set_max_size(5).await.expect("set_max_size should not fail");
            scheduler.run_pending().await;

            assert_eq!(4, cache.size().await.expect("size should not fail"));
            assert_eq!(vec!["c".to_string()], live_keys(&cache).await);
        }
    })
    .await;
}

#[tokio::test]
async fn entry_count_cap_is_enforced() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let scheduler = super::ManualScheduler::new();
            let config = crate::CacheConfigBuilder::from_path(&dir)
                .app_version(super::APP_VERSION)
                .value_count(super::VALUE_COUNT)
                .max_size(1000)
                .max_count(2)
                .scheduler(scheduler.clone())
                .build()
                .expect("config should build");
            let cache = crate::Cache::open(config).await;

            set_entry(&cache, "a", &["a", "a"]).await;
            set_entry(&cache, "b", &["b", "b"]).await;
            set_entry(&cache, "c", &["c", "c"]).await;
            scheduler.run_pending().await;

            assert_eq!(
                vec!["b".to_string(), "c".to_string()],
                live_keys(&cache).await
            );
        }
    })
    .await;
}

#[tokio::test]
async fn evict_all_removes_every_entry() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, _scheduler) = create_cache(&dir, 100).await;

            set_entry(&cache, "a", &["aa", "aa"]).await;
            set_entry(&cache, "b", &["bb", "bb"]).await;

            cache.evict_all().await.expect("evict_all should not fail");

            assert_eq!(0, cache.size().await.expect("size should not fail"));
            assert!(read_entry(&cache, "a").await.is_none());
            assert!(read_entry(&cache, "b").await.is_none());
            crate::assert_file_does_not_exist!(&dir.join("a.0"));
            crate::assert_file_does_not_exist!(&dir.join("b.1"));
        }
    })
    .await;
}

#[tokio::test]
async fn evict_all_detaches_in_flight_edit() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, _scheduler) = create_cache(&dir, 100).await;

            let mut editor = cache
                .edit("k1")
                .await
                .expect("edit should not fail")
                .expect("editor should be available");
            let mut sink = editor.new_sink(0).await.expect("sink should open");
            sink.write_all(b"doomed").await.expect("write should not fail");

            cache.evict_all().await.expect("evict_all should not fail");

            // The sink became a black hole and the commit is an orphan: it succeeds without
            // resurrecting the entry.
            sink.write_all(b" bytes").await.expect("write should not fail");
            sink.shutdown().await.expect("shutdown should not fail");
            drop(sink);
            let mut other = editor.new_sink(1).await.expect("sink should open");
            other.write_all(b"more").await.expect("write should not fail");
            other.shutdown().await.expect("shutdown should not fail");
            drop(other);
            editor.commit().await.expect("orphan commit should not fail");

            assert!(read_entry(&cache, "k1").await.is_none());
            crate::assert_file_does_not_exist!(&dir.join("k1.0"));
            crate::assert_file_does_not_exist!(&dir.join("k1.0.tmp"));

            // The eviction journals the edit's only completion record.
            assert_eq!(
                "disk-cache-journal\n1\n100\n2\n\nDIRTY k1\nREMOVE k1\n",
                journal_contents(&dir).await
            );
        }
    })
    .await;
}

#[tokio::test]
async fn maintenance_submissions_are_coalesced() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let (cache, scheduler) = create_cache(&dir, 2).await;

            // Every commit here leaves the cache over its cap and wants a trim, but only one
            // maintenance task may sit in the queue at a time.
            set_entry(&cache, "a", &["aa", "aa"]).await;
            set_entry(&cache, "b", &["bb", "bb"]).await;
            set_entry(&cache, "c", &["cc", "cc"]).await;
            assert_eq!(1, scheduler.pending());

            scheduler.run_pending().await;
            assert!(cache.size().await.expect("size should not fail") <= 2);
        }
    })
    .await;
}
