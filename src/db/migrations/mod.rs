use log::info;
use sqlx::{Executor, PgPool};
use std::{fs, path::Path};

/// Apply every .sql file in the migrations directory, ordered by the
/// numeric prefix of the file name.
pub async fn run_migrations(
    pool: &PgPool,
    migrations_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut entries = fs::read_dir(migrations_dir)?
        .filter_map(Result::ok)
        .filter(|entry| {
            let path = entry.path();
            path.extension().map(|ext| ext == "sql").unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect::<Vec<_>>();

    entries.sort_by_key(|path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        name.split('_')
            .next()
            .and_then(|prefix| prefix.parse::<usize>().ok())
            .unwrap_or(usize::MAX)
    });

    for path in entries {
        execute_migration_file(pool, &path).await?;
        info!("Applied migration: {}", path.display());
    }

    Ok(())
}

async fn execute_migration_file(
    pool: &PgPool,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let sql = fs::read_to_string(path)?;
    pool.execute(&*sql).await?;
    Ok(())
}
