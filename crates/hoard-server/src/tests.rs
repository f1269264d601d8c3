use std::sync::Arc;

use hoard_core::Timestamp;
use hoard_core::account::{AccountType, ContentScope, PermissionLevel, Permissions};
use hoard_core::bandwidth::{BandwidthKind, BandwidthWindow};
use hoard_core::content::{ClientAction, ClientContent, ContentKind, FileInfo};
use hoard_core::error::ApiError;
use hoard_core::id::{AccessKey, FileHash, ServiceKey};
use hoard_core::service::{ServiceKind, ServiceOptions};
use hoard_core::tag::Tag;
use hoard_core::update::{
    ClientUpdate, ClientUpdateEntry, PetitionStatus, UpdateBundle,
};
use hoard_server_db::{Database, RepoStateRecord, ServiceInfoKind, repo_states};
use hoard_util_error::BoxedErrorResult;
use tempfile::TempDir;

use crate::task::bundler::Bundler;
use crate::task::deferred_delete::DeferredDeleter;
use crate::{Actor, Engine, EngineConfig};

async fn temp_engine() -> BoxedErrorResult<(TempDir, Arc<Engine>)> {
    let dir = tempfile::tempdir()?;
    let mut config = EngineConfig::new(dir.path());
    config.start_workers = false;
    let engine = Engine::start(config).await?;
    Ok((dir, engine))
}

async fn admin_actor(engine: &Engine) -> BoxedErrorResult<(ServiceKey, Actor)> {
    let bootstrap = engine.bootstrap_admin().expect("fresh install").clone();
    let actor = engine
        .actor_for_access_key(bootstrap.service_key, bootstrap.access_key)
        .await?;
    Ok((bootstrap.service_key, actor))
}

/// Provision a repository plus its admin actor.
async fn mk_repo(
    engine: &Engine,
    kind: ServiceKind,
) -> BoxedErrorResult<(ServiceKey, Actor)> {
    let (_, server_admin) = admin_actor(engine).await?;
    let (service_key, admin_access) = engine
        .create_service(&server_admin, kind, "test repo", 45_872, ServiceOptions::default())
        .await?;
    let actor = engine.actor_for_access_key(service_key, admin_access).await?;
    Ok((service_key, actor))
}

/// Register a fresh account with the given permissions and log it in.
async fn mk_user(
    engine: &Engine,
    service_key: ServiceKey,
    repo_admin: &Actor,
    permissions: Permissions,
) -> BoxedErrorResult<(AccessKey, Actor)> {
    let account_type_id = engine
        .add_account_type(
            repo_admin,
            service_key,
            AccountType::new("user", permissions),
        )
        .await?;
    let issued = engine
        .issue_registration_keys(repo_admin, service_key, account_type_id, 1, None)
        .await?;
    let access_key = engine
        .fetch_access_key(service_key, issued[0].registration_key)
        .await?;
    let actor = engine.actor_for_access_key(service_key, access_key).await?;
    Ok((access_key, actor))
}

fn petition_permissions(kind: ContentKind) -> Permissions {
    let mut permissions = Permissions::new();
    permissions.grant(ContentScope::from(kind), PermissionLevel::Petition);
    permissions
}

async fn service_total(
    engine: &Engine,
    actor: &Actor,
    service_key: ServiceKey,
    kind: ServiceInfoKind,
) -> BoxedErrorResult<i64> {
    Ok(engine
        .service_info(actor, service_key)
        .await?
        .into_iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, v)| v)
        .unwrap_or(0))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_bootstrap_and_session_roundtrip() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let bootstrap = engine.bootstrap_admin().expect("fresh install").clone();

    let (session_key, expires_at) = engine
        .begin_session(bootstrap.service_key, bootstrap.access_key)
        .await?;
    assert!(Timestamp::now() < expires_at);

    // the session resolves to the same account until it expires
    let actor = engine.actor_for_session(bootstrap.service_key, session_key)?;
    assert!(actor.account.is_admin());
    let again = engine.actor_for_session(bootstrap.service_key, session_key)?;
    assert_eq!(actor.account.key, again.account.key);

    // an unknown session is refused
    let unknown = engine.actor_for_session(
        bootstrap.service_key,
        hoard_core::id::SessionKey::generate(),
    );
    assert!(matches!(unknown, Err(ApiError::Unauthorized { .. })));

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_petition_resolution_end_to_end() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;
    let (_, user) = mk_user(
        &engine,
        service_key,
        &repo_admin,
        petition_permissions(ContentKind::Mappings),
    )
    .await?;

    let tag = Tag::new("foo")?;
    let h1 = FileHash::digest_of(b"h1");
    let h2 = FileHash::digest_of(b"h2");

    // the mappings exist (committed by the moderator)
    engine
        .process_update(
            &repo_admin,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Pend,
                content: ClientContent::Mappings {
                    tag: tag.clone(),
                    hashes: vec![h1, h2],
                },
                reason: None,
            }]),
        )
        .await?;
    assert_eq!(
        service_total(&engine, &repo_admin, service_key, ServiceInfoKind::NumMappings).await?,
        2
    );

    // the user petitions their removal
    engine
        .process_update(
            &user,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Petition,
                content: ClientContent::Mappings {
                    tag: tag.clone(),
                    hashes: vec![h1, h2],
                },
                reason: Some("not foo".to_owned()),
            }]),
        )
        .await?;

    let counts = engine.num_petitions(&repo_admin, service_key).await?;
    assert_eq!(counts.get(ContentKind::Mappings, PetitionStatus::Petitioned), 1);

    let headers = engine
        .petitions_summary(
            &repo_admin,
            service_key,
            ContentKind::Mappings,
            PetitionStatus::Petitioned,
            10,
            None,
            None,
        )
        .await?;
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].account_key, user.account.key);
    assert_eq!(headers[0].reason, "not foo");

    let petition = engine
        .get_petition(
            &repo_admin,
            service_key,
            ContentKind::Mappings,
            PetitionStatus::Petitioned,
            user.account.key,
            "not foo".to_owned(),
        )
        .await?;

    engine.approve_petition(&repo_admin, service_key, &petition).await?;

    assert_eq!(
        service_total(&engine, &repo_admin, service_key, ServiceInfoKind::NumMappings).await?,
        0
    );
    assert_eq!(
        service_total(
            &engine,
            &repo_admin,
            service_key,
            ServiceInfoKind::NumDeletedMappings
        )
        .await?,
        2
    );
    let counts = engine.num_petitions(&repo_admin, service_key).await?;
    assert_eq!(counts.get(ContentKind::Mappings, PetitionStatus::Petitioned), 0);

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_forbidden_without_permission() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;
    // no grants at all
    let (_, user) = mk_user(&engine, service_key, &repo_admin, Permissions::new()).await?;

    let res = engine
        .process_update(
            &user,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Pend,
                content: ClientContent::Mappings {
                    tag: Tag::new("x")?,
                    hashes: vec![FileHash::digest_of(b"y")],
                },
                reason: None,
            }]),
        )
        .await;
    assert!(matches!(res, Err(ApiError::Forbidden { .. })));

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_file_upload_download_and_deferred_delete() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::FileRepo).await?;

    let bytes = b"file payload".to_vec();
    let hash = FileHash::digest_of(&bytes);
    let info = FileInfo {
        hash,
        size: bytes.len() as u64,
        mime: "image/png".to_owned(),
        width: Some(10),
        height: Some(10),
        duration_ms: None,
        num_frames: None,
        num_words: None,
    };

    engine
        .put_file(
            &repo_admin,
            service_key,
            info.clone(),
            bytes.clone(),
            Some(b"thumb".to_vec()),
        )
        .await?;

    // digest mismatch is rejected before anything lands
    let bad = engine
        .put_file(
            &repo_admin,
            service_key,
            FileInfo {
                hash: FileHash::digest_of(b"other"),
                ..info.clone()
            },
            bytes.clone(),
            None,
        )
        .await;
    assert!(matches!(bad, Err(ApiError::BadRequest { .. })));

    assert_eq!(engine.get_file(&repo_admin, service_key, hash).await?, bytes);
    assert_eq!(
        engine.get_thumbnail(&repo_admin, service_key, hash).await?,
        b"thumb".to_vec()
    );

    // delete: logical first, physical via the worker
    engine
        .process_update(
            &repo_admin,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Petition,
                content: ClientContent::Files { hashes: vec![hash] },
                reason: Some("takedown".to_owned()),
            }]),
        )
        .await?;

    // the blob survives until the worker runs
    assert_eq!(engine.get_file(&repo_admin, service_key, hash).await?, bytes);

    let engine_ref = engine.handle.engine_ref().expect("engine alive");
    let processed = DeferredDeleter::process_one(&engine_ref).await?;
    assert!(processed);

    let gone = engine.get_file(&repo_admin, service_key, hash).await;
    assert!(matches!(gone, Err(ApiError::NotFound { .. })));

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_readd_clears_deferred_delete_before_worker_runs() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::FileRepo).await?;

    let bytes = b"sticky file".to_vec();
    let hash = FileHash::digest_of(&bytes);
    let info = FileInfo {
        hash,
        size: bytes.len() as u64,
        mime: "image/png".to_owned(),
        width: None,
        height: None,
        duration_ms: None,
        num_frames: None,
        num_words: None,
    };

    engine
        .put_file(&repo_admin, service_key, info.clone(), bytes.clone(), None)
        .await?;
    engine
        .process_update(
            &repo_admin,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Petition,
                content: ClientContent::Files { hashes: vec![hash] },
                reason: Some("oops".to_owned()),
            }]),
        )
        .await?;

    // re-upload before the worker ticks: the queue row is cleared
    engine
        .put_file(&repo_admin, service_key, info, bytes.clone(), None)
        .await?;

    let engine_ref = engine.handle.engine_ref().expect("engine alive");
    let processed = DeferredDeleter::process_one(&engine_ref).await?;
    assert!(!processed, "queue must be empty after the re-add");

    assert_eq!(engine.get_file(&repo_admin, service_key, hash).await?, bytes);

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_bundler_emits_window_and_serves_update() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;
    let service_id = repo_admin.service_id;

    engine
        .process_update(
            &repo_admin,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Pend,
                content: ClientContent::Mappings {
                    tag: Tag::new("bundled")?,
                    hashes: vec![FileHash::digest_of(b"z")],
                },
                reason: None,
            }]),
        )
        .await?;

    // pull the due time to the present so the next sync cuts exactly one
    // window covering the commit above
    let due = Timestamp::now();
    engine
        .serializer()
        .write(move |tx| {
            let mut repo_states_table = tx.open_table(&repo_states::TABLE)?;
            Database::set_repo_state_tx(
                service_id,
                RepoStateRecord {
                    next_update_due: due,
                    next_nullification_update_index: 0,
                },
                &mut repo_states_table,
            )?;
            Ok(())
        })
        .await?;

    let record = engine.registry().get(service_id)?;
    let engine_ref = engine.handle.engine_ref().expect("engine alive");
    let created = Bundler::sync_service(&engine_ref, service_id, &record).await?;
    assert!(created);

    let metadata = engine.metadata(&repo_admin, service_key).await?;
    assert_eq!(metadata.entries.len(), 1);
    let entry = &metadata.entries[0];
    assert!(!entry.update_hashes.is_empty());
    assert_eq!(
        metadata.next_update_due,
        entry
            .end
            .saturating_add_secs(record.options.clamped_update_period())
    );

    // fetching a bundle returns bytes whose digest is its name, and the
    // committed row is inside
    let mut found_mapping = false;
    for hash in &entry.update_hashes {
        let bytes = engine.get_update(&repo_admin, service_key, *hash).await?;
        assert_eq!(hoard_core::id::UpdateHash::digest_of(&bytes), *hash);
        if let UpdateBundle::ContentV0(content) = UpdateBundle::from_bytes(&bytes)? {
            found_mapping |= !content.mapping_adds.is_empty();
        }
    }
    assert!(found_mapping, "the committed mapping must appear in the window");

    // the metadata slice from a later index is empty but keeps the due time
    let slice = engine.metadata_slice(&repo_admin, service_key, 1).await?;
    assert!(slice.entries.is_empty());
    assert_eq!(slice.next_update_due, metadata.next_update_due);

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_bandwidth_gate() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;

    let mut permissions = Permissions::new();
    permissions.grant(ContentScope::Mappings, PermissionLevel::Petition);
    let mut account_type = AccountType::new("throttled", permissions);
    account_type.bandwidth_rules.add_rule(
        BandwidthKind::Data,
        BandwidthWindow::Seconds(60),
        10 * 1024,
    );
    let account_type_id = engine
        .add_account_type(&repo_admin, service_key, account_type)
        .await?;
    let issued = engine
        .issue_registration_keys(&repo_admin, service_key, account_type_id, 1, None)
        .await?;
    let access_key = engine
        .fetch_access_key(service_key, issued[0].registration_key)
        .await?;
    let user = engine.actor_for_access_key(service_key, access_key).await?;

    // burn through the quota, then get refused
    engine.consume_bandwidth(&user, 20 * 1024).await?;
    let refused = engine.consume_bandwidth(&user, 1).await;
    assert!(matches!(refused, Err(ApiError::BandwidthExceeded)));

    // the admin type carries no rules, so nothing blocks it
    engine.consume_bandwidth(&repo_admin, 100 * 1024 * 1024).await?;
    engine.consume_bandwidth(&repo_admin, 1).await?;

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_lock_pauses_the_serializer() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;
    let (_, server_admin) = admin_actor(&engine).await?;

    engine.lock_on(&server_admin).await?;

    let busy = engine.metadata(&repo_admin, service_key).await;
    assert!(matches!(busy, Err(ApiError::Busy)));

    engine.lock_off(&server_admin).await?;
    engine.metadata(&repo_admin, service_key).await?;

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_ban_refreshes_live_sessions() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;
    let (access_key, user) = mk_user(
        &engine,
        service_key,
        &repo_admin,
        petition_permissions(ContentKind::Mappings),
    )
    .await?;

    let (session_key, _) = engine.begin_session(service_key, access_key).await?;

    engine
        .ban_account(&repo_admin, service_key, user.account.key, "spam", None)
        .await?;

    // the live session sees the ban immediately
    let actor = engine.actor_for_session(service_key, session_key)?;
    assert!(actor.account.is_banned(Timestamp::now()));

    let res = engine
        .process_update(
            &actor,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Pend,
                content: ClientContent::Mappings {
                    tag: Tag::new("nope")?,
                    hashes: vec![FileHash::digest_of(b"n")],
                },
                reason: None,
            }]),
        )
        .await;
    assert!(matches!(res, Err(ApiError::Unauthorized { .. })));

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_delete_all_content_resumable() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (service_key, repo_admin) = mk_repo(&engine, ServiceKind::TagRepo).await?;

    let mut permissions = Permissions::new();
    permissions.grant(ContentScope::Mappings, PermissionLevel::Create);
    let (_, user) = mk_user(&engine, service_key, &repo_admin, permissions).await?;

    // the user authored some rows
    engine
        .process_update(
            &user,
            service_key,
            ClientUpdate::new(vec![ClientUpdateEntry {
                action: ClientAction::Pend,
                content: ClientContent::Mappings {
                    tag: Tag::new("mine")?,
                    hashes: vec![FileHash::digest_of(b"1"), FileHash::digest_of(b"2")],
                },
                reason: None,
            }]),
        )
        .await?;
    assert_eq!(
        service_total(&engine, &repo_admin, service_key, ServiceInfoKind::NumMappings).await?,
        2
    );

    let fully_done = engine
        .delete_all_content(&repo_admin, service_key, user.account.key)
        .await?;
    assert!(fully_done);
    assert_eq!(
        service_total(&engine, &repo_admin, service_key, ServiceInfoKind::NumMappings).await?,
        0
    );

    let info = engine
        .get_account_info(&repo_admin, service_key, user.account.key)
        .await?;
    assert!(info.content.values().all(|c| c.current == 0));

    engine.shutdown().await;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_storage_cap_conflicts_for_non_moderators() -> BoxedErrorResult<()> {
    let (_dir, engine) = temp_engine().await?;
    let (_, server_admin) = admin_actor(&engine).await?;
    let (service_key, admin_access) = engine
        .create_service(
            &server_admin,
            ServiceKind::FileRepo,
            "tiny repo",
            45_873,
            ServiceOptions {
                max_storage: Some(8),
                ..Default::default()
            },
        )
        .await?;
    let repo_admin = engine.actor_for_access_key(service_key, admin_access).await?;

    let mut permissions = Permissions::new();
    permissions.grant(ContentScope::Files, PermissionLevel::Create);
    let (_, uploader) = mk_user(&engine, service_key, &repo_admin, permissions).await?;

    let bytes = b"way more than eight bytes".to_vec();
    let info = FileInfo {
        hash: FileHash::digest_of(&bytes),
        size: bytes.len() as u64,
        mime: "image/png".to_owned(),
        width: None,
        height: None,
        duration_ms: None,
        num_frames: None,
        num_words: None,
    };

    let refused = engine
        .put_file(&uploader, service_key, info.clone(), bytes.clone(), None)
        .await;
    assert!(matches!(refused, Err(ApiError::Conflict { .. })));

    // moderators bypass the cap
    engine
        .put_file(&repo_admin, service_key, info, bytes, None)
        .await?;

    engine.shutdown().await;
    Ok(())
}
