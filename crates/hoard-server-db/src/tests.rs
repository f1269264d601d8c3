use hoard_core::Timestamp;
use hoard_core::content::{ContentKind, FileInfo};
use hoard_core::error::ApiError;
use hoard_core::id::{AccessKey, FileHash, ServiceKey};
use hoard_core::service::{ServiceKind, ServiceOptions};
use hoard_core::tag::Tag;
use hoard_core::id::UpdateHash;
use hoard_core::update::{PetitionStatus, UpdateBundle};
use hoard_util_error::BoxedErrorResult;

use crate::{
    AccountRecord, Database, DbError, ProvisionedService, ServiceInfoKind, accounts,
    deferred_deletes, master_hash_ids, petition_index, repo_states, service_info, services,
    update_metadata,
};

async fn temp_db() -> BoxedErrorResult<Database> {
    Ok(Database::new_in_memory().await?)
}

async fn mk_service(db: &Database, kind: ServiceKind) -> BoxedErrorResult<ProvisionedService> {
    let now = Timestamp::from_secs(1_000);
    let provisioned = db
        .write_with(|tx| {
            Database::create_service_tx(
                tx,
                ServiceKey::generate(),
                kind,
                "test service",
                45_871,
                ServiceOptions::default(),
                now,
            )
        })
        .await?;
    Ok(provisioned)
}

/// Resolve a provisioned admin's access key into its (account_id, record).
async fn admin_account(
    db: &Database,
    provisioned: &ProvisionedService,
) -> BoxedErrorResult<(hoard_core::AccountId, AccountRecord)> {
    let service_id = provisioned.service_id;
    let access_key = provisioned.admin_access_key;
    let out = db
        .write_with(|tx| {
            let account_key =
                Database::resolve_access_key_tx(tx, service_id, access_key, Timestamp::from_secs(1_001))?;
            let account_id = {
                let account_ids_table = tx.open_table(&crate::account_ids::TABLE)?;
                Database::get_account_id_tx(service_id, account_key, &account_ids_table)?
                    .expect("admin account exists")
            };
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            let record = Database::get_account_tx(service_id, account_id, &accounts_table)?
                .expect("admin account exists");
            Ok((account_id, record))
        })
        .await?;
    Ok(out)
}

fn file_info(seed: u8) -> FileInfo {
    let bytes = vec![seed; 64];
    FileInfo {
        hash: FileHash::digest_of(&bytes),
        size: bytes.len() as u64,
        mime: "image/png".to_owned(),
        width: Some(100),
        height: Some(50),
        duration_ms: None,
        num_frames: None,
        num_words: None,
    }
}

async fn service_total(
    db: &Database,
    service_id: hoard_core::ServiceId,
    kind: ServiceInfoKind,
) -> BoxedErrorResult<i64> {
    let total = db
        .read_with(|tx| {
            let service_info_table = tx.open_table(&service_info::TABLE)?;
            Database::get_service_info_tx(service_id, kind, &service_info_table)
        })
        .await?;
    Ok(total)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_service_provisioning() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;

    let record = db
        .read_with(|tx| {
            let services_table = tx.open_table(&services::TABLE)?;
            Database::get_service_tx(provisioned.service_id, &services_table)
        })
        .await?
        .expect("service exists");

    assert_eq!(record.kind, ServiceKind::TagRepo);

    let (_, admin_record) = admin_account(&db, &provisioned).await?;
    let admin_type = db
        .read_with(|tx| {
            let account_types_table = tx.open_table(&crate::account_types::TABLE)?;
            Database::get_account_type_tx(
                provisioned.service_id,
                admin_record.account_type_id,
                &account_types_table,
            )
        })
        .await?
        .expect("admin type exists");
    assert!(admin_type.account_type.has_permission(
        hoard_core::account::ContentScope::Mappings,
        hoard_core::account::PermissionLevel::Moderate
    ));

    // repo state seeded with a due time one period out
    let state = db
        .read_with(|tx| {
            let repo_states_table = tx.open_table(&repo_states::TABLE)?;
            Database::get_repo_state_tx(provisioned.service_id, &repo_states_table)
        })
        .await?
        .expect("repo state exists");
    assert_eq!(
        state.next_update_due,
        Timestamp::from_secs(1_000 + record.options.clamped_update_period())
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_registration_key_rotation_and_single_redemption() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (_, admin_record) = admin_account(&db, &provisioned).await?;

    // a non-null, non-admin type to register against
    let user_type_id = db
        .write_with(|tx| {
            let mut permissions = hoard_core::account::Permissions::new();
            permissions.grant(
                hoard_core::account::ContentScope::Mappings,
                hoard_core::account::PermissionLevel::Petition,
            );
            Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new("user", permissions),
            )
        })
        .await?;
    let _ = admin_record;

    let issued = db
        .write_with(move |tx| {
            Database::issue_registration_keys_tx(tx, service_id, user_type_id, 1, None)
        })
        .await?;
    assert_eq!(issued.len(), 1);
    let registration_key = issued[0].registration_key;
    let initial_access = issued[0].access_key;

    let now = Timestamp::from_secs(2_000);

    // every fetch rotates the access key
    let first = db
        .write_with(move |tx| Database::fetch_access_key_tx(tx, service_id, registration_key, now))
        .await?;
    assert_ne!(first, initial_access);
    let second = db
        .write_with(move |tx| Database::fetch_access_key_tx(tx, service_id, registration_key, now))
        .await?;
    assert_ne!(first, second);

    // the rotated-away key no longer resolves
    let stale = db
        .write_with(move |tx| Database::resolve_access_key_tx(tx, service_id, first, now))
        .await;
    assert!(matches!(
        stale,
        Err(DbError::Api {
            source: ApiError::Unauthorized { .. }
        })
    ));

    // the latest key materializes the account and burns the registration
    let account_key = db
        .write_with(move |tx| Database::resolve_access_key_tx(tx, service_id, second, now))
        .await?;

    // second resolve hits the accounts table, same account
    let account_key_again = db
        .write_with(move |tx| Database::resolve_access_key_tx(tx, service_id, second, now))
        .await?;
    assert_eq!(account_key, account_key_again);

    // the registration key is spent
    let spent = db
        .write_with(move |tx| Database::fetch_access_key_tx(tx, service_id, registration_key, now))
        .await;
    assert!(matches!(
        spent,
        Err(DbError::Api {
            source: ApiError::Unauthorized { .. }
        })
    ));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_issue_registration_against_null_type_fails() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;

    let null_type_id = db
        .read_with(|tx| {
            let services_table = tx.open_table(&services::TABLE)?;
            Ok(Database::get_service_tx(service_id, &services_table)?
                .expect("service exists")
                .null_account_type_id)
        })
        .await?;

    let res = db
        .write_with(move |tx| {
            Database::issue_registration_keys_tx(tx, service_id, null_type_id, 1, None)
        })
        .await;
    assert!(matches!(
        res,
        Err(DbError::Api {
            source: ApiError::BadRequest { .. }
        })
    ));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_file_add_delete_readd_counters() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::FileRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let info = file_info(7);
    let hash = info.hash;
    let t_add = Timestamp::from_secs(5_000);

    let info_clone = info.clone();
    db.write_with(move |tx| {
        Database::add_file_tx(tx, service_id, admin_id, &info_clone, false, t_add)
    })
    .await?;

    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumFiles).await?, 1);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::FileStorageBytes).await?,
        64
    );

    // delete: current → deleted, net counters move
    let deleted = db
        .write_with(move |tx| {
            Database::delete_files_tx(tx, service_id, admin_id, &[hash], Timestamp::from_secs(5_100))
        })
        .await?;
    assert_eq!(deleted, 1);
    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumFiles).await?, 0);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumDeletedFiles).await?,
        1
    );
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::FileStorageBytes).await?,
        0
    );

    // sole reference gone: the blob sits in the deferred-delete queue
    let queued = db
        .read_with(|tx| {
            let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
            let master = Database::lookup_master_hash_id_tx(hash, &master_hash_ids_table)?
                .expect("hash known");
            let deferred_deletes_table = tx.open_table(&deferred_deletes::TABLE)?;
            Ok(deferred_deletes_table.get(&master)?.is_some())
        })
        .await?;
    assert!(queued, "orphaned blob must be queued for physical deletion");

    // re-add without overwrite is refused
    let info_clone = info.clone();
    let blocked = db
        .write_with(move |tx| {
            Database::add_file_tx(
                tx,
                service_id,
                admin_id,
                &info_clone,
                false,
                Timestamp::from_secs(5_200),
            )
        })
        .await;
    assert!(matches!(
        blocked,
        Err(DbError::Api {
            source: ApiError::Conflict { .. }
        })
    ));

    // re-add with overwrite restores and clears the deferred queue
    let info_clone = info.clone();
    db.write_with(move |tx| {
        Database::add_file_tx(
            tx,
            service_id,
            admin_id,
            &info_clone,
            true,
            Timestamp::from_secs(5_300),
        )
    })
    .await?;
    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumFiles).await?, 1);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumDeletedFiles).await?,
        0
    );
    let still_queued = db
        .read_with(|tx| {
            let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
            let master = Database::lookup_master_hash_id_tx(hash, &master_hash_ids_table)?
                .expect("hash known");
            let deferred_deletes_table = tx.open_table(&deferred_deletes::TABLE)?;
            Ok(deferred_deletes_table.get(&master)?.is_some())
        })
        .await?;
    assert!(!still_queued, "re-adding must clear the deferred-delete row");

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_pend_then_add_promotes_and_rewards() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    // a plain account to do the pending
    let user_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                hoard_core::id::AccountKey::generate(),
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let tag = Tag::new("series:some show")?;
    let hashes = [FileHash::digest_of(b"a"), FileHash::digest_of(b"b")];
    let now = Timestamp::from_secs(6_000);

    let tag_clone = tag.clone();
    let pended = db
        .write_with(move |tx| {
            Database::pend_mappings_tx(tx, service_id, user_id, &tag_clone, &hashes, "add these", now)
        })
        .await?;
    assert_eq!(pended, 2);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumPendingMappings).await?,
        2
    );

    // a moderator committing the same rows clears the pending queue and
    // rewards the pender
    let tag_clone = tag.clone();
    let added = db
        .write_with(move |tx| {
            Database::add_mappings_tx(tx, service_id, admin_id, &tag_clone, &hashes, false, now)
        })
        .await?;
    assert_eq!(added, 2);
    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumMappings).await?, 2);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumPendingMappings).await?,
        0
    );

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, 2, "one point per promoted row");

    // the petition index entry is gone
    let counts = db
        .read_with(move |tx| {
            let petition_index_table = tx.open_table(&petition_index::TABLE)?;
            Database::get_petition_counts_tx(service_id, &petition_index_table)
        })
        .await?;
    assert_eq!(counts.get(ContentKind::Mappings, PetitionStatus::Pending), 0);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_petition_summary_approve_deny_flow() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let user_key = hoard_core::id::AccountKey::generate();
    let user_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                user_key,
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let tag = Tag::new("foo")?;
    let h1 = FileHash::digest_of(b"h1");
    let h2 = FileHash::digest_of(b"h2");
    let now = Timestamp::from_secs(7_000);

    // commit the mappings, then petition their removal
    let tag_clone = tag.clone();
    db.write_with(move |tx| {
        Database::add_mappings_tx(tx, service_id, admin_id, &tag_clone, &[h1, h2], false, now)
    })
    .await?;

    let tag_clone = tag.clone();
    let petitioned = db
        .write_with(move |tx| {
            Database::petition_mappings_tx(
                tx,
                service_id,
                user_id,
                &tag_clone,
                &[h1, h2],
                "not foo",
                now,
            )
        })
        .await?;
    assert_eq!(petitioned, 2);

    // summary surfaces the (account, reason) header
    let headers = db
        .write_with(move |tx| {
            Database::get_petitions_summary_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Petitioned,
                10,
                None,
                None,
            )
        })
        .await?;
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].account_key, user_key);
    assert_eq!(headers[0].reason, "not foo");

    // full fetch materializes the mapping rows
    let petition = db
        .write_with(move |tx| {
            Database::get_petition_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Petitioned,
                user_key,
                "not foo",
                now,
            )
        })
        .await?;
    assert!(!petition.truncated);
    let (_, contents) = &petition.actions[0];
    match &contents[0] {
        hoard_core::content::ClientContent::Mappings { tag: t, hashes } => {
            assert_eq!(t, &tag);
            assert_eq!(hashes.len(), 2);
        }
        other => panic!("expected mappings content, got {other:?}"),
    }

    // approval replays through the delete path: counters move, rows drop,
    // the petitioner scores a point per row
    let tag_clone = tag.clone();
    db.write_with(move |tx| {
        Database::delete_mappings_tx(tx, service_id, admin_id, &tag_clone, &[h1, h2], now)
    })
    .await?;

    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumMappings).await?, 0);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumDeletedMappings).await?,
        2
    );
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumPetitionedMappings).await?,
        0
    );

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    // mapping petitions score flat, one point per approved row
    assert_eq!(score, 2);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_deny_petition_docks_score() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let user_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                hoard_core::id::AccountKey::generate(),
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let tag = Tag::new("bar")?;
    let h1 = FileHash::digest_of(b"x");
    let now = Timestamp::from_secs(8_000);

    let tag_clone = tag.clone();
    db.write_with(move |tx| {
        Database::add_mappings_tx(tx, service_id, admin_id, &tag_clone, &[h1], false, now)
    })
    .await?;
    let tag_clone = tag.clone();
    db.write_with(move |tx| {
        Database::petition_mappings_tx(tx, service_id, user_id, &tag_clone, &[h1], "bad", now)
    })
    .await?;

    let dropped = db
        .write_with(move |tx| {
            let reason_id = Database::intern_reason_tx(tx, "bad")?;
            Database::deny_mapping_petitions_tx(tx, service_id, user_id, reason_id)
        })
        .await?;
    assert_eq!(dropped, 1);

    // rows stayed current, petition gone, score negative
    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumMappings).await?, 1);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumPetitionedMappings).await?,
        0
    );
    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, -1);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_sibling_bad_tag_is_primary_key() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let bad = Tag::new("colour")?;
    let good1 = Tag::new("color")?;
    let good2 = Tag::new("hue")?;
    let now = Timestamp::from_secs(9_000);

    let (b, g) = (bad.clone(), good1.clone());
    db.write_with(move |tx| {
        Database::add_tag_sibling_tx(tx, service_id, admin_id, &b, &g, false, now)
    })
    .await?;
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumTagSiblings).await?,
        1
    );

    // repointing the bad tag replaces the pairing inside one transaction
    let (b, g) = (bad.clone(), good2.clone());
    db.write_with(move |tx| {
        Database::add_tag_sibling_tx(tx, service_id, admin_id, &b, &g, false, now)
    })
    .await?;

    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumTagSiblings).await?,
        1,
        "a bad tag maps to at most one good tag"
    );
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumDeletedTagSiblings).await?,
        1,
        "the replaced pairing moves to deleted"
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_regenerate_service_info_matches_maintained_totals() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let now = Timestamp::from_secs(10_000);
    db.write_with(move |tx| {
        let tag_a = Tag::new("a").expect("valid");
        let tag_b = Tag::new("b").expect("valid");
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &tag_a,
            &[FileHash::digest_of(b"1"), FileHash::digest_of(b"2")],
            false,
            now,
        )?;
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &tag_b,
            &[FileHash::digest_of(b"2")],
            false,
            now,
        )?;
        Database::delete_mappings_tx(
            tx,
            service_id,
            admin_id,
            &tag_a,
            &[FileHash::digest_of(b"1")],
            now,
        )?;
        Database::add_tag_parent_tx(tx, service_id, admin_id, &tag_a, &tag_b, false, now)?;
        Database::add_tag_sibling_tx(tx, service_id, admin_id, &tag_b, &tag_a, false, now)?;
        Ok(())
    })
    .await?;

    let maintained = db
        .read_with(move |tx| {
            let service_info_table = tx.open_table(&service_info::TABLE)?;
            Database::get_all_service_info_tx(service_id, &service_info_table)
        })
        .await?;

    db.write_with(move |tx| Database::regenerate_service_info_tx(tx, service_id))
        .await?;

    let regenerated = db
        .read_with(move |tx| {
            let service_info_table = tx.open_table(&service_info::TABLE)?;
            Database::get_all_service_info_tx(service_id, &service_info_table)
        })
        .await?;

    for (kind, value) in &regenerated {
        let maintained_value = maintained
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| *v)
            .unwrap_or(0);
        assert_eq!(
            maintained_value, *value,
            "maintained total for {kind:?} must match a from-scratch scan"
        );
    }

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_update_bundle_window_and_metadata() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let begin = Timestamp::from_secs(20_000);
    let end = Timestamp::from_secs(20_100);

    // inside the window
    db.write_with(move |tx| {
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &Tag::new("inside").expect("valid"),
            &[FileHash::digest_of(b"in")],
            false,
            Timestamp::from_secs(20_010),
        )
    })
    .await?;
    // outside the window
    db.write_with(move |tx| {
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &Tag::new("outside").expect("valid"),
            &[FileHash::digest_of(b"out")],
            false,
            Timestamp::from_secs(30_000),
        )
    })
    .await?;

    let bundles = db
        .read_with(move |tx| Database::build_update_tx(tx, service_id, begin, end))
        .await?;

    // one definitions bundle + one content bundle for the in-window rows
    assert_eq!(bundles.len(), 2);
    let UpdateBundle::DefinitionsV0(definitions) = &bundles[0] else {
        panic!("definitions come first");
    };
    assert_eq!(definitions.tags.len(), 1);
    assert_eq!(definitions.hashes.len(), 1);
    let UpdateBundle::ContentV0(content) = &bundles[1] else {
        panic!("content second");
    };
    assert_eq!(content.mapping_adds.len(), 1);
    assert_eq!(content.mapping_adds[0].hash_ids.len(), 1);

    // bundle identity is the digest of its bytes
    let bytes = bundles[0].to_bytes();
    assert_eq!(bundles[0].compute_hash(), UpdateHash::digest_of(&bytes));

    // register and check the metadata laws
    let hashes: Vec<UpdateHash> = bundles.iter().map(|b| b.compute_hash()).collect();
    let hashes_clone = hashes.clone();
    let index = db
        .write_with(move |tx| {
            Database::register_update_tx(tx, service_id, &hashes_clone, begin, end, 100)
        })
        .await?;
    assert_eq!(index, 0);

    let metadata = db
        .read_with(move |tx| {
            let update_metadata_table = tx.open_table(&update_metadata::TABLE)?;
            let repo_states_table = tx.open_table(&repo_states::TABLE)?;
            Database::get_update_metadata_tx(service_id, &update_metadata_table, &repo_states_table)
        })
        .await?;
    assert_eq!(metadata.entries.len(), 1);
    assert_eq!(metadata.entries[0].update_hashes, hashes);
    assert_eq!(metadata.next_update_due, Timestamp::from_secs(20_200));

    let next_begin = db
        .read_with(move |tx| {
            let update_metadata_table = tx.open_table(&update_metadata::TABLE)?;
            Database::next_update_begin_tx(service_id, &update_metadata_table)
        })
        .await?;
    assert_eq!(next_begin, Some(Timestamp::from_secs(20_101)));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_nullification_rewrites_window_authors() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let null_account_id = db
        .read_with(move |tx| {
            let services_table = tx.open_table(&services::TABLE)?;
            Ok(Database::get_service_tx(service_id, &services_table)?
                .expect("service exists")
                .null_account_id)
        })
        .await?;

    let in_window = Timestamp::from_secs(40_000);
    let out_of_window = Timestamp::from_secs(50_000);
    db.write_with(move |tx| {
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &Tag::new("old").expect("valid"),
            &[FileHash::digest_of(b"old")],
            false,
            in_window,
        )?;
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &Tag::new("new").expect("valid"),
            &[FileHash::digest_of(b"new")],
            false,
            out_of_window,
        )?;
        Ok(())
    })
    .await?;

    let rewritten = db
        .write_with(move |tx| {
            Database::nullify_window_tx(
                tx,
                service_id,
                null_account_id,
                Timestamp::from_secs(39_000),
                Timestamp::from_secs(41_000),
            )
        })
        .await?;
    assert_eq!(rewritten, 1);

    // the in-window row is anonymous now, the other untouched
    let authors = db
        .read_with(move |tx| {
            let mappings_current_table = tx.open_table(&crate::mappings_current::TABLE)?;
            let mut authors = vec![];
            for res in mappings_current_table.range(
                (service_id, hoard_core::ServiceTagId::ZERO, hoard_core::ServiceHashId::ZERO)
                    ..=(service_id, hoard_core::ServiceTagId::MAX, hoard_core::ServiceHashId::MAX),
            )? {
                let (_, v) = res?;
                let record = v.value();
                authors.push((record.committed_at, record.account_id));
            }
            Ok(authors)
        })
        .await?;
    assert!(authors.contains(&(in_window, null_account_id)));
    assert!(authors.contains(&(out_of_window, admin_id)));

    // advancing the cursor works even with nothing nullified
    let cursor = db
        .write_with(move |tx| {
            let mut repo_states_table = tx.open_table(&repo_states::TABLE)?;
            Database::advance_nullification_cursor_tx(service_id, &mut repo_states_table)
        })
        .await?;
    assert_eq!(cursor, 1);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_null_account_cannot_be_modified() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;

    let null_key = db
        .read_with(move |tx| {
            let services_table = tx.open_table(&services::TABLE)?;
            let null_account_id = Database::get_service_tx(service_id, &services_table)?
                .expect("service exists")
                .null_account_id;
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, null_account_id, &accounts_table)?
                .expect("null account exists")
                .key)
        })
        .await?;

    let banned = db
        .write_with(move |tx| {
            Database::ban_account_tx(
                tx,
                service_id,
                null_key,
                "no",
                None,
                Timestamp::from_secs(1_000),
            )
        })
        .await;
    assert!(matches!(
        banned,
        Err(DbError::Api {
            source: ApiError::BadRequest { .. }
        })
    ));

    let expired = db
        .write_with(move |tx| {
            Database::set_account_expires_tx(
                tx,
                service_id,
                null_key,
                Some(Timestamp::from_secs(2_000)),
            )
        })
        .await;
    assert!(matches!(
        expired,
        Err(DbError::Api {
            source: ApiError::BadRequest { .. }
        })
    ));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_petition_summary_spreads_across_accounts() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let now = Timestamp::from_secs(11_000);

    // one prolific petitioner with many reasons, three others with one each
    let mut accounts = vec![];
    for _ in 0..4 {
        let id = db
            .write_with(move |tx| {
                let type_id = Database::create_account_type_tx(
                    tx,
                    service_id,
                    hoard_core::account::AccountType::new(
                        "user",
                        hoard_core::account::Permissions::new(),
                    ),
                )?;
                Database::create_account_tx(
                    tx,
                    service_id,
                    hoard_core::id::AccountKey::generate(),
                    type_id,
                    now,
                    None,
                    AccessKey::generate().digest(),
                )
            })
            .await?;
        accounts.push(id);
    }

    // seed mappings and petition them under distinct reasons
    for (i, hash_seed) in (0u8..12).enumerate() {
        let tag = Tag::new(&format!("tag {i}"))?;
        let hash = FileHash::digest_of(&[hash_seed]);
        let petitioner = if i < 9 { accounts[0] } else { accounts[i - 8] };
        let reason = format!("reason {i}");
        let tag_clone = tag.clone();
        db.write_with(move |tx| {
            Database::add_mappings_tx(tx, service_id, admin_id, &tag_clone, &[hash], false, now)?;
            Database::petition_mappings_tx(
                tx, service_id, petitioner, &tag_clone, &[hash], &reason, now,
            )?;
            Ok(())
        })
        .await?;
    }

    let headers = db
        .write_with(move |tx| {
            Database::get_petitions_summary_tx(
                tx,
                service_id,
                ContentKind::Mappings,
                PetitionStatus::Petitioned,
                4,
                None,
                None,
            )
        })
        .await?;

    assert_eq!(headers.len(), 4);
    let distinct_accounts: std::collections::BTreeSet<_> =
        headers.iter().map(|h| h.account_key).collect();
    assert_eq!(
        distinct_accounts.len(),
        4,
        "with four petitioners and limit 4, every account gets one slot"
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_pending_sibling_superseded_by_petitioned() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let user_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                hoard_core::id::AccountKey::generate(),
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let now = Timestamp::from_secs(12_000);
    let bad = Tag::new("misspelt")?;
    let good = Tag::new("misspelled")?;
    let better = Tag::new("typo")?;

    // current sibling the user wants removed, plus a pending replacement,
    // both under the same reason
    let (b, g, r) = (bad.clone(), good.clone(), better.clone());
    db.write_with(move |tx| {
        Database::add_tag_sibling_tx(tx, service_id, admin_id, &b, &g, false, now)?;
        Database::petition_tag_sibling_tx(tx, service_id, user_id, &b, &g, "rework", now)?;
        Database::pend_tag_sibling_tx(tx, service_id, user_id, &b, &r, "rework", now)?;
        Ok(())
    })
    .await?;

    let counts = db
        .read_with(move |tx| {
            let petition_index_table = tx.open_table(&petition_index::TABLE)?;
            Database::get_petition_counts_tx(service_id, &petition_index_table)
        })
        .await?;

    assert_eq!(
        counts.get(ContentKind::TagSiblings, PetitionStatus::Petitioned),
        1
    );
    assert_eq!(
        counts.get(ContentKind::TagSiblings, PetitionStatus::Pending),
        0,
        "a pending petition is not actionable while a petitioned one with the same reason exists"
    );

    // and the summary agrees
    let pending_headers = db
        .write_with(move |tx| {
            Database::get_petitions_summary_tx(
                tx,
                service_id,
                ContentKind::TagSiblings,
                PetitionStatus::Pending,
                10,
                None,
                None,
            )
        })
        .await?;
    assert!(pending_headers.is_empty());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_orphan_filter_respects_cross_service_references() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let repo_a = mk_service(&db, ServiceKind::FileRepo).await?;
    let repo_b = mk_service(&db, ServiceKind::FileRepo).await?;
    let (admin_a, _) = admin_account(&db, &repo_a).await?;
    let (admin_b, _) = admin_account(&db, &repo_b).await?;
    let (sid_a, sid_b) = (repo_a.service_id, repo_b.service_id);

    let info = file_info(42);
    let hash = info.hash;
    let now = Timestamp::from_secs(13_000);

    let info_clone = info.clone();
    db.write_with(move |tx| {
        Database::add_file_tx(tx, sid_a, admin_a, &info_clone, false, now)?;
        Ok(())
    })
    .await?;
    let info_clone = info.clone();
    db.write_with(move |tx| {
        Database::add_file_tx(tx, sid_b, admin_b, &info_clone, false, now)?;
        Ok(())
    })
    .await?;

    // deleting in one service must not enqueue: the other still holds it
    db.write_with(move |tx| {
        Database::delete_files_tx(tx, sid_a, admin_a, &[hash], now)?;
        Ok(())
    })
    .await?;
    let queued = db
        .read_with(move |tx| {
            let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
            let master = Database::lookup_master_hash_id_tx(hash, &master_hash_ids_table)?
                .expect("hash known");
            let deferred_deletes_table = tx.open_table(&deferred_deletes::TABLE)?;
            Ok(deferred_deletes_table.get(&master)?.is_some())
        })
        .await?;
    assert!(!queued, "still referenced by another service");

    // deleting the last reference enqueues
    db.write_with(move |tx| {
        Database::delete_files_tx(tx, sid_b, admin_b, &[hash], now)?;
        Ok(())
    })
    .await?;
    let queued = db
        .read_with(move |tx| {
            let master_hash_ids_table = tx.open_table(&master_hash_ids::TABLE)?;
            let master = Database::lookup_master_hash_id_tx(hash, &master_hash_ids_table)?
                .expect("hash known");
            let deferred_deletes_table = tx.open_table(&deferred_deletes::TABLE)?;
            Ok(deferred_deletes_table.get(&master)?.is_some())
        })
        .await?;
    assert!(queued, "orphaned once the last reference is gone");

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_delete_account_content_slices() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let subject_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                hoard_core::id::AccountKey::generate(),
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let now = Timestamp::from_secs(14_000);
    db.write_with(move |tx| {
        for i in 0u8..5 {
            Database::add_mappings_tx(
                tx,
                service_id,
                subject_id,
                &Tag::new(&format!("t{i}")).expect("valid"),
                &[FileHash::digest_of(&[i])],
                false,
                now,
            )?;
        }
        Database::pend_tag_sibling_tx(
            tx,
            service_id,
            subject_id,
            &Tag::new("a").expect("valid"),
            &Tag::new("b").expect("valid"),
            "merge",
            now,
        )?;
        Ok(())
    })
    .await?;

    // a small slice leaves work behind
    let outcome = db
        .write_with(move |tx| {
            Database::delete_account_content_slice_tx(tx, service_id, admin_id, subject_id, 2, now)
        })
        .await?;
    assert!(!outcome.fully_done);
    assert!(0 < outcome.rows_affected);

    // keep slicing to completion
    loop {
        let outcome = db
            .write_with(move |tx| {
                Database::delete_account_content_slice_tx(
                    tx, service_id, admin_id, subject_id, 500, now,
                )
            })
            .await?;
        if outcome.fully_done {
            break;
        }
    }

    assert_eq!(service_total(&db, service_id, ServiceInfoKind::NumMappings).await?, 0);
    assert_eq!(
        service_total(&db, service_id, ServiceInfoKind::NumPendingTagSiblings).await?,
        0
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_tag_parent_resolution_weighted_by_child_mappings() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let user_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                hoard_core::id::AccountKey::generate(),
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let child = Tag::new("child")?;
    let parent = Tag::new("parent")?;
    let now = Timestamp::from_secs(15_000);

    // the child tag carries three mappings, so the pair weighs three
    let child_clone = child.clone();
    db.write_with(move |tx| {
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &child_clone,
            &[
                FileHash::digest_of(b"p1"),
                FileHash::digest_of(b"p2"),
                FileHash::digest_of(b"p3"),
            ],
            false,
            now,
        )
    })
    .await?;

    let (c, p) = (child.clone(), parent.clone());
    db.write_with(move |tx| {
        Database::add_tag_parent_tx(tx, service_id, admin_id, &c, &p, false, now)?;
        Database::petition_tag_parent_tx(tx, service_id, user_id, &c, &p, "undo", now)?;
        Ok(())
    })
    .await?;

    // approval replays the delete, rewarding the child tag's weight
    let (c, p) = (child.clone(), parent.clone());
    db.write_with(move |tx| {
        Database::delete_tag_parent_tx(tx, service_id, admin_id, &c, &p, now)
    })
    .await?;

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, 3, "parent petition rewards the child's mapping count");

    // a denied petition docks the same weight
    let (c, p) = (child.clone(), parent.clone());
    db.write_with(move |tx| {
        Database::add_tag_parent_tx(tx, service_id, admin_id, &c, &p, true, now)?;
        Database::petition_tag_parent_tx(tx, service_id, user_id, &c, &p, "undo again", now)?;
        let reason_id = Database::intern_reason_tx(tx, "undo again")?;
        Database::deny_tag_parent_petitions_tx(tx, service_id, user_id, reason_id)?;
        Ok(())
    })
    .await?;

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, 0, "denial docks the child's mapping count");

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_tag_sibling_resolution_weighted_by_bad_mappings() -> BoxedErrorResult<()> {
    let db = temp_db().await?;
    let provisioned = mk_service(&db, ServiceKind::TagRepo).await?;
    let service_id = provisioned.service_id;
    let (admin_id, _) = admin_account(&db, &provisioned).await?;

    let user_id = db
        .write_with(move |tx| {
            let type_id = Database::create_account_type_tx(
                tx,
                service_id,
                hoard_core::account::AccountType::new(
                    "user",
                    hoard_core::account::Permissions::new(),
                ),
            )?;
            Database::create_account_tx(
                tx,
                service_id,
                hoard_core::id::AccountKey::generate(),
                type_id,
                Timestamp::from_secs(1_500),
                None,
                AccessKey::generate().digest(),
            )
        })
        .await?;

    let bad = Tag::new("teh")?;
    let good = Tag::new("the")?;
    let now = Timestamp::from_secs(16_000);

    // the bad tag carries two mappings, so the pair weighs two
    let bad_clone = bad.clone();
    db.write_with(move |tx| {
        Database::add_mappings_tx(
            tx,
            service_id,
            admin_id,
            &bad_clone,
            &[FileHash::digest_of(b"s1"), FileHash::digest_of(b"s2")],
            false,
            now,
        )
    })
    .await?;

    // a promoted pend rewards the pender by the bad tag's weight
    let (b, g) = (bad.clone(), good.clone());
    db.write_with(move |tx| {
        Database::pend_tag_sibling_tx(tx, service_id, user_id, &b, &g, "merge", now)?;
        Database::add_tag_sibling_tx(tx, service_id, admin_id, &b, &g, false, now)?;
        Ok(())
    })
    .await?;

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, 2, "sibling pend promotion rewards the bad tag's weight");

    // an approved removal petition rewards the same weight
    let (b, g) = (bad.clone(), good.clone());
    db.write_with(move |tx| {
        Database::petition_tag_sibling_tx(tx, service_id, user_id, &b, &g, "split", now)?;
        Database::delete_tag_sibling_tx(tx, service_id, admin_id, &b, now)?;
        Ok(())
    })
    .await?;

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, 4, "sibling petition approval rewards the bad tag's weight");

    // a denied pend docks the weight
    let good2 = Tag::new("ye")?;
    let (b, g) = (bad.clone(), good2.clone());
    db.write_with(move |tx| {
        Database::pend_tag_sibling_tx(tx, service_id, user_id, &b, &g, "again", now)?;
        let reason_id = Database::intern_reason_tx(tx, "again")?;
        Database::deny_tag_sibling_pends_tx(tx, service_id, user_id, reason_id)?;
        Ok(())
    })
    .await?;

    let score = db
        .read_with(move |tx| {
            let accounts_table = tx.open_table(&accounts::TABLE)?;
            Ok(Database::get_account_tx(service_id, user_id, &accounts_table)?
                .expect("account exists")
                .petition_score)
        })
        .await?;
    assert_eq!(score, 2, "sibling pend denial docks the bad tag's weight");

    Ok(())
}
