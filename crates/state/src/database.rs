//! Database connection and typed operations for apps, versions, and comments.

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database as SeaOrmDatabase, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entity::{apps, comments, requirement_files, versions};
use crate::entity::apps::AppStatus;
use crate::entity::comments::CommentStatus;
use crate::entity::versions::VersionStatus;

/// Delimiter between appended build-log transcripts.
const BUILD_LOG_DELIMITER: &str = "\n\n========================================\n\n";

/// State database connection wrapper
pub struct Database {
    connection: DatabaseConnection,
}

impl Database {
    /// Create a new database connection with pooling and a short retry loop.
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to state database...");

        let mut attempts = 0;
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(2);

        loop {
            attempts += 1;

            let mut opt = sea_orm::ConnectOptions::new(database_url.to_string());
            opt.max_connections(50)
                .min_connections(5)
                .connect_timeout(Duration::from_secs(10))
                .acquire_timeout(Duration::from_secs(30))
                .idle_timeout(Duration::from_secs(300))
                .sqlx_logging(false);

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    info!("Successfully connected to state database");
                    return Ok(Self { connection });
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    warn!(
                        "Failed to connect to state database (attempt {}/{}): {}",
                        attempts, MAX_ATTEMPTS, e
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to state database after {} attempts",
                        MAX_ATTEMPTS
                    );
                    return Err(anyhow!("Database connection failed: {}", e));
                }
            }
        }
    }

    /// Fresh in-memory SQLite database with the schema applied. Used by
    /// tests and storage-less local development.
    pub async fn new_in_memory() -> Result<Self> {
        // One connection only: every pooled connection to `sqlite::memory:`
        // would otherwise get its own empty database.
        let mut opt = sea_orm::ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1).sqlx_logging(false);
        let connection = SeaOrmDatabase::connect(opt).await?;
        crate::schema::create_tables(&connection).await?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    // ---------------------------------------------------------------- apps

    pub async fn create_app(
        &self,
        user_id: &str,
        name: &str,
        description: &str,
    ) -> Result<apps::Model> {
        let now = Utc::now();
        let app = apps::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            user_id: Set(user_id.to_string()),
            name: Set(name.to_string()),
            description: Set(description.to_string()),
            status: Set(AppStatus::Draft),
            prod_version: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(app.insert(&self.connection).await?)
    }

    pub async fn get_app(&self, app_id: &str) -> Result<Option<apps::Model>> {
        Ok(apps::Entity::find_by_id(app_id.to_string())
            .one(&self.connection)
            .await?)
    }

    /// Fetch an app only if `user_id` owns it.
    pub async fn get_app_owned(&self, app_id: &str, user_id: &str) -> Result<Option<apps::Model>> {
        Ok(apps::Entity::find_by_id(app_id.to_string())
            .filter(apps::Column::UserId.eq(user_id))
            .one(&self.connection)
            .await?)
    }

    pub async fn update_app_status(&self, app_id: &str, status: AppStatus) -> Result<()> {
        let res = apps::Entity::update_many()
            .col_expr(apps::Column::Status, Expr::value(status))
            .col_expr(apps::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(apps::Column::Id.eq(app_id))
            .exec(&self.connection)
            .await?;
        if res.rows_affected == 0 {
            return Err(anyhow!("app not found: {}", app_id));
        }
        Ok(())
    }

    // ------------------------------------------------------------ versions

    /// Create the next version of an app in `pending`.
    ///
    /// The number is assigned as `1 + max(existing)` inside a transaction so
    /// it stays monotonic and unique within the app.
    pub async fn create_version(&self, app_id: &str) -> Result<versions::Model> {
        let txn = self.connection.begin().await?;

        let newest = versions::Entity::find()
            .filter(versions::Column::AppId.eq(app_id))
            .order_by_desc(versions::Column::VersionNumber)
            .one(&txn)
            .await?;
        let next_number = newest.map(|v| v.version_number).unwrap_or(0) + 1;

        let version = versions::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            app_id: Set(app_id.to_string()),
            version_number: Set(next_number),
            status: Set(VersionStatus::Pending),
            artifact_key: Set(None),
            deploy_url: Set(None),
            deploy_id: Set(None),
            build_log: Set(None),
            error_message: Set(None),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
        };
        let model = version.insert(&txn).await?;

        txn.commit().await?;
        Ok(model)
    }

    pub async fn get_version(&self, version_id: &str) -> Result<Option<versions::Model>> {
        Ok(versions::Entity::find_by_id(version_id.to_string())
            .one(&self.connection)
            .await?)
    }

    /// All versions of an app, newest first.
    pub async fn list_versions(&self, app_id: &str) -> Result<Vec<versions::Model>> {
        Ok(versions::Entity::find()
            .filter(versions::Column::AppId.eq(app_id))
            .order_by_desc(versions::Column::VersionNumber)
            .all(&self.connection)
            .await?)
    }

    /// The newest `completed` version of an app that has an artifact.
    pub async fn latest_completed_artifact(
        &self,
        app_id: &str,
    ) -> Result<Option<versions::Model>> {
        Ok(versions::Entity::find()
            .filter(versions::Column::AppId.eq(app_id))
            .filter(versions::Column::Status.eq(VersionStatus::Completed))
            .filter(versions::Column::ArtifactKey.is_not_null())
            .order_by_desc(versions::Column::VersionNumber)
            .one(&self.connection)
            .await?)
    }

    /// Conditional `pending → building` write. Returns whether this caller
    /// won the transition; a lost race means another run owns the version.
    pub async fn try_mark_building(&self, version_id: &str) -> Result<bool> {
        let res = versions::Entity::update_many()
            .col_expr(versions::Column::Status, Expr::value(VersionStatus::Building))
            .filter(versions::Column::Id.eq(version_id))
            .filter(versions::Column::Status.eq(VersionStatus::Pending))
            .exec(&self.connection)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// Append a transcript to the version's build log, delimited from any
    /// prior transcripts.
    pub async fn append_build_log(&self, version_id: &str, transcript: &str) -> Result<()> {
        let txn = self.connection.begin().await?;

        let version = versions::Entity::find_by_id(version_id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| anyhow!("version not found: {}", version_id))?;

        let log = match version.build_log {
            Some(ref existing) if !existing.is_empty() => {
                format!("{}{}{}", existing, BUILD_LOG_DELIMITER, transcript)
            }
            _ => transcript.to_string(),
        };

        let mut active: versions::ActiveModel = version.into();
        active.build_log = Set(Some(log));
        active.update(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    pub async fn set_artifact_key(&self, version_id: &str, artifact_key: &str) -> Result<()> {
        let res = versions::Entity::update_many()
            .col_expr(
                versions::Column::ArtifactKey,
                Expr::value(Some(artifact_key.to_string())),
            )
            .filter(versions::Column::Id.eq(version_id))
            .exec(&self.connection)
            .await?;
        if res.rows_affected == 0 {
            return Err(anyhow!("version not found: {}", version_id));
        }
        Ok(())
    }

    pub async fn set_deploy_result(
        &self,
        version_id: &str,
        deploy_url: &str,
        deploy_id: &str,
    ) -> Result<()> {
        let res = versions::Entity::update_many()
            .col_expr(
                versions::Column::DeployUrl,
                Expr::value(Some(deploy_url.to_string())),
            )
            .col_expr(
                versions::Column::DeployId,
                Expr::value(Some(deploy_id.to_string())),
            )
            .filter(versions::Column::Id.eq(version_id))
            .exec(&self.connection)
            .await?;
        if res.rows_affected == 0 {
            return Err(anyhow!("version not found: {}", version_id));
        }
        Ok(())
    }

    /// `building → completed`, stamping `completed_at`. Guarded so a
    /// terminal version is never overwritten.
    pub async fn mark_completed(&self, version_id: &str) -> Result<()> {
        let res = versions::Entity::update_many()
            .col_expr(
                versions::Column::Status,
                Expr::value(VersionStatus::Completed),
            )
            .col_expr(versions::Column::CompletedAt, Expr::value(Some(Utc::now())))
            .filter(versions::Column::Id.eq(version_id))
            .filter(versions::Column::Status.eq(VersionStatus::Building))
            .exec(&self.connection)
            .await?;
        if res.rows_affected == 0 {
            return Err(anyhow!(
                "version {} is not in building state, refusing to mark completed",
                version_id
            ));
        }
        Ok(())
    }

    /// Transition a non-terminal version to `failed` with a reason. Guarded
    /// so failure is sticky: a version already terminal stays as it is.
    pub async fn mark_failed(&self, version_id: &str, error_message: &str) -> Result<()> {
        let res = versions::Entity::update_many()
            .col_expr(versions::Column::Status, Expr::value(VersionStatus::Failed))
            .col_expr(
                versions::Column::ErrorMessage,
                Expr::value(Some(error_message.to_string())),
            )
            .filter(versions::Column::Id.eq(version_id))
            .filter(
                versions::Column::Status
                    .is_in([VersionStatus::Pending, VersionStatus::Building]),
            )
            .exec(&self.connection)
            .await?;
        if res.rows_affected == 0 {
            warn!(
                "mark_failed: version {} missing or already terminal, leaving as is",
                version_id
            );
        }
        Ok(())
    }

    /// `completed → promoted`, recording the version number as the app's
    /// production version. Rejects any other source state.
    pub async fn promote_version(&self, version_id: &str) -> Result<versions::Model> {
        let txn = self.connection.begin().await?;

        let version = versions::Entity::find_by_id(version_id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| anyhow!("version not found: {}", version_id))?;

        if version.status != VersionStatus::Completed {
            return Err(anyhow!(
                "only completed versions can be promoted (version {} is {:?})",
                version_id,
                version.status
            ));
        }

        apps::Entity::update_many()
            .col_expr(
                apps::Column::ProdVersion,
                Expr::value(Some(version.version_number)),
            )
            .col_expr(apps::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(apps::Column::Id.eq(version.app_id.clone()))
            .exec(&txn)
            .await?;

        let mut active: versions::ActiveModel = version.into();
        active.status = Set(VersionStatus::Promoted);
        let promoted = active.update(&txn).await?;

        txn.commit().await?;
        Ok(promoted)
    }

    // ------------------------------------------------------------ comments

    pub async fn create_comment(
        &self,
        app_id: &str,
        user_id: &str,
        page_path: &str,
        element_path: &str,
        content: &str,
    ) -> Result<comments::Model> {
        let comment = comments::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            app_id: Set(app_id.to_string()),
            version_id: Set(None),
            user_id: Set(user_id.to_string()),
            page_path: Set(page_path.to_string()),
            element_path: Set(element_path.to_string()),
            content: Set(content.to_string()),
            status: Set(CommentStatus::Draft),
            created_at: Set(Utc::now()),
            submitted_at: Set(None),
        };
        Ok(comment.insert(&self.connection).await?)
    }

    /// Atomically attach a batch of draft comments to a version and mark
    /// them submitted.
    pub async fn submit_comments(&self, comment_ids: &[String], version_id: &str) -> Result<()> {
        if comment_ids.is_empty() {
            return Ok(());
        }
        comments::Entity::update_many()
            .col_expr(
                comments::Column::VersionId,
                Expr::value(Some(version_id.to_string())),
            )
            .col_expr(
                comments::Column::Status,
                Expr::value(CommentStatus::Submitted),
            )
            .col_expr(comments::Column::SubmittedAt, Expr::value(Some(Utc::now())))
            .filter(comments::Column::Id.is_in(comment_ids.to_vec()))
            .filter(comments::Column::Status.eq(CommentStatus::Draft))
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    /// Comments attached to a version, ordered by draft-creation time.
    /// Callers that need the order of a submission request must reorder
    /// against the id list they submitted.
    pub async fn get_version_comments(&self, version_id: &str) -> Result<Vec<comments::Model>> {
        Ok(comments::Entity::find()
            .filter(comments::Column::VersionId.eq(version_id))
            .order_by_asc(comments::Column::CreatedAt)
            .all(&self.connection)
            .await?)
    }

    // --------------------------------------------------- requirement files

    pub async fn list_requirement_files(
        &self,
        version_id: &str,
    ) -> Result<Vec<requirement_files::Model>> {
        Ok(requirement_files::Entity::find()
            .filter(requirement_files::Column::VersionId.eq(version_id))
            .order_by_asc(requirement_files::Column::CreatedAt)
            .all(&self.connection)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new_in_memory().await.unwrap()
    }

    async fn test_app(db: &Database) -> apps::Model {
        db.create_app("user-1", "Test App", "A test app").await.unwrap()
    }

    #[tokio::test]
    async fn test_version_numbers_are_monotonic() {
        let db = test_db().await;
        let app = test_app(&db).await;

        let v1 = db.create_version(&app.id).await.unwrap();
        let v2 = db.create_version(&app.id).await.unwrap();
        let v3 = db.create_version(&app.id).await.unwrap();

        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(v3.version_number, 3);
        assert_eq!(v1.status, VersionStatus::Pending);

        // Numbers are per app, not global.
        let other = test_app(&db).await;
        let o1 = db.create_version(&other.id).await.unwrap();
        assert_eq!(o1.version_number, 1);
    }

    #[tokio::test]
    async fn test_try_mark_building_is_single_winner() {
        let db = test_db().await;
        let app = test_app(&db).await;
        let version = db.create_version(&app.id).await.unwrap();

        assert!(db.try_mark_building(&version.id).await.unwrap());
        assert!(!db.try_mark_building(&version.id).await.unwrap());

        let reloaded = db.get_version(&version.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, VersionStatus::Building);
    }

    #[tokio::test]
    async fn test_terminal_states_are_sticky() {
        let db = test_db().await;
        let app = test_app(&db).await;
        let version = db.create_version(&app.id).await.unwrap();

        db.try_mark_building(&version.id).await.unwrap();
        db.mark_failed(&version.id, "prebuild exploded").await.unwrap();

        // A failed version cannot be re-entered or completed.
        assert!(!db.try_mark_building(&version.id).await.unwrap());
        assert!(db.mark_completed(&version.id).await.is_err());

        // mark_failed on a terminal version is a no-op, not an overwrite.
        db.mark_failed(&version.id, "second failure").await.unwrap();
        let reloaded = db.get_version(&version.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, VersionStatus::Failed);
        assert_eq!(reloaded.error_message.as_deref(), Some("prebuild exploded"));
    }

    #[tokio::test]
    async fn test_promote_requires_completed() {
        let db = test_db().await;
        let app = test_app(&db).await;
        let version = db.create_version(&app.id).await.unwrap();

        assert!(db.promote_version(&version.id).await.is_err());

        db.try_mark_building(&version.id).await.unwrap();
        db.mark_completed(&version.id).await.unwrap();

        let promoted = db.promote_version(&version.id).await.unwrap();
        assert_eq!(promoted.status, VersionStatus::Promoted);

        let app = db.get_app(&app.id).await.unwrap().unwrap();
        assert_eq!(app.prod_version, Some(version.version_number));
    }

    #[tokio::test]
    async fn test_completed_stamps_completion_time() {
        let db = test_db().await;
        let app = test_app(&db).await;
        let version = db.create_version(&app.id).await.unwrap();

        db.try_mark_building(&version.id).await.unwrap();
        db.mark_completed(&version.id).await.unwrap();

        let reloaded = db.get_version(&version.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, VersionStatus::Completed);
        assert!(reloaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_append_build_log_keeps_prior_transcripts() {
        let db = test_db().await;
        let app = test_app(&db).await;
        let version = db.create_version(&app.id).await.unwrap();

        db.append_build_log(&version.id, "first transcript").await.unwrap();
        db.append_build_log(&version.id, "second transcript").await.unwrap();

        let reloaded = db.get_version(&version.id).await.unwrap().unwrap();
        let log = reloaded.build_log.unwrap();
        assert!(log.contains("first transcript"));
        assert!(log.contains("second transcript"));
        assert!(log.contains(BUILD_LOG_DELIMITER.trim()));
    }

    #[tokio::test]
    async fn test_latest_completed_artifact_skips_failed_and_artifactless() {
        let db = test_db().await;
        let app = test_app(&db).await;

        // v1: completed with artifact
        let v1 = db.create_version(&app.id).await.unwrap();
        db.try_mark_building(&v1.id).await.unwrap();
        db.set_artifact_key(&v1.id, "apps/a/versions/v1/code.tar.gz")
            .await
            .unwrap();
        db.mark_completed(&v1.id).await.unwrap();

        // v2: failed
        let v2 = db.create_version(&app.id).await.unwrap();
        db.try_mark_building(&v2.id).await.unwrap();
        db.mark_failed(&v2.id, "boom").await.unwrap();

        // v3: completed but no artifact recorded
        let v3 = db.create_version(&app.id).await.unwrap();
        db.try_mark_building(&v3.id).await.unwrap();
        db.mark_completed(&v3.id).await.unwrap();

        let latest = db.latest_completed_artifact(&app.id).await.unwrap().unwrap();
        assert_eq!(latest.id, v1.id);

        assert!(
            db.latest_completed_artifact("no-such-app")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_submit_comments_assigns_version() {
        let db = test_db().await;
        let app = test_app(&db).await;
        let version = db.create_version(&app.id).await.unwrap();

        let c1 = db
            .create_comment(&app.id, "user-1", "/", "h1", "Make it purple")
            .await
            .unwrap();
        let c2 = db
            .create_comment(&app.id, "user-1", "/about", "general", "Add a footer")
            .await
            .unwrap();

        db.submit_comments(&[c1.id.clone(), c2.id.clone()], &version.id)
            .await
            .unwrap();

        let submitted = db.get_version_comments(&version.id).await.unwrap();
        assert_eq!(submitted.len(), 2);
        assert!(submitted.iter().all(|c| c.status == CommentStatus::Submitted));
        assert!(submitted.iter().all(|c| c.submitted_at.is_some()));
        assert_eq!(submitted[0].id, c1.id);
    }

    #[tokio::test]
    async fn test_ownership_check() {
        let db = test_db().await;
        let app = test_app(&db).await;

        assert!(db.get_app_owned(&app.id, "user-1").await.unwrap().is_some());
        assert!(db.get_app_owned(&app.id, "someone-else").await.unwrap().is_none());
    }
}
