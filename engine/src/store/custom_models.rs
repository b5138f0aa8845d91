// In engine/src/store/custom_models.rs
use crate::registry::{ModelDescriptor, ProviderType};
use crate::Error;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, label, provider_type, base_url, model_identifier, has_api_key, \
                       context_length, default_temperature";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ModelDescriptor> {
    let provider: String = row.get(2)?;
    let provider_type = provider.parse::<ProviderType>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(ModelDescriptor {
        id: row.get(0)?,
        label: row.get(1)?,
        provider_type,
        base_url: row.get(3)?,
        model_identifier: row.get(4)?,
        api_key: None,
        has_api_key: row.get(5)?,
        context_length: row.get(6)?,
        default_temperature: row.get(7)?,
    })
}

/// All custom descriptors, oldest first.
pub fn list(conn: &Connection) -> Result<Vec<ModelDescriptor>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM custom_models ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    let models = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(models)
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<ModelDescriptor>, Error> {
    let model = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM custom_models WHERE id = ?1"),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(model)
}

/// Insert or replace a descriptor. Any plaintext key on `model` is ignored.
pub fn upsert(conn: &Connection, model: &ModelDescriptor) -> Result<(), Error> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO custom_models (id, label, provider_type, base_url, model_identifier, \
                                    has_api_key, context_length, default_temperature, \
                                    created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(id) DO UPDATE SET
            label = excluded.label,
            provider_type = excluded.provider_type,
            base_url = excluded.base_url,
            model_identifier = excluded.model_identifier,
            has_api_key = excluded.has_api_key,
            context_length = excluded.context_length,
            default_temperature = excluded.default_temperature,
            updated_at = excluded.updated_at",
        params![
            model.id,
            model.label,
            model.provider_type.as_str(),
            model.base_url,
            model.model_identifier,
            model.has_api_key,
            model.context_length,
            model.default_temperature,
            now,
        ],
    )?;
    Ok(())
}

/// Returns false when no row matched.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, Error> {
    let removed = conn.execute("DELETE FROM custom_models WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use anyhow::Result;

    fn groq(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            label: "Groq Llama".into(),
            provider_type: ProviderType::Groq,
            base_url: Some("https://api.groq.com/openai/v1".into()),
            model_identifier: "llama-3.3-70b-versatile".into(),
            api_key: Some("gsk_secret".into()),
            has_api_key: true,
            context_length: 8192,
            default_temperature: Some(0.2),
        }
    }

    #[test]
    fn upsert_get_and_delete() -> Result<()> {
        let pool = store::open_memory_pool()?;
        let conn = pool.get()?;

        upsert(&conn, &groq("groq-1"))?;
        let stored = get(&conn, "groq-1")?.expect("stored");
        assert_eq!(stored.api_key, None);
        assert!(stored.has_api_key);
        assert_eq!(stored.context_length, 8192);

        let mut renamed = groq("groq-1");
        renamed.label = "Renamed".into();
        upsert(&conn, &renamed)?;
        assert_eq!(list(&conn)?.len(), 1);
        assert_eq!(get(&conn, "groq-1")?.unwrap().label, "Renamed");

        assert!(delete(&conn, "groq-1")?);
        assert!(!delete(&conn, "groq-1")?);
        assert!(get(&conn, "groq-1")?.is_none());
        Ok(())
    }
}
