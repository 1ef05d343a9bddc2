//! Table layouts and fixed statements of the store.
//!
//! Filter queries are compiled elsewhere; this module only holds the DDL run
//! at store initialisation and the parameterised statements used by writers.
use super::compiler::Entity;

/// A physical store table and the statements that create it.
pub trait StoreTable {
    fn name(&self) -> &str;

    fn entity(&self) -> Entity;

    /// Statements creating the table and its indexes, in execution order.
    fn create_statements(&self) -> Vec<String>;

    fn select_last_id(&self) -> String {
        format!("SELECT id FROM {} ORDER BY id DESC LIMIT 1", self.name())
    }

    fn count(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", self.name())
    }

    fn clear(&self) -> String {
        format!("TRUNCATE TABLE {}", self.name())
    }

    fn drop_table(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObsTable {
    name: String,
}

impl ObsTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Upsert keyed on (datastream, foi, phenomenon time, result time);
    /// returns the row id either way. A NULL foi takes part in the key as 0.
    pub fn insert(&self) -> String {
        format!(
            "INSERT INTO {t} (datastreamid, foiid, phenomenonTime, resultTime, result) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (datastreamid, (COALESCE(foiid, 0)), phenomenonTime, resultTime) \
             DO UPDATE SET id = {t}.id RETURNING id",
            t = self.name
        )
    }
}

impl StoreTable for ObsTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity(&self) -> Entity {
        Entity::Observation
    }

    fn create_statements(&self) -> Vec<String> {
        let t = &self.name;
        vec![
            // JSON rather than JSONB keeps the key order of results
            format!(
                "CREATE TABLE {t} (id BIGSERIAL PRIMARY KEY, datastreamid bigint, foiid bigint, \
                 phenomenonTime TIMESTAMPTZ, resultTime TIMESTAMPTZ, result JSON)"
            ),
            format!("CREATE INDEX {t}_datastream_idx ON {t} (datastreamid)"),
            format!("CREATE INDEX {t}_phenomenon_time_idx ON {t} (phenomenonTime)"),
            format!("CREATE INDEX {t}_result_time_idx ON {t} (resultTime)"),
            format!(
                "CREATE UNIQUE INDEX {t}_unique_constraint ON {t} \
                 (datastreamid, (COALESCE(foiid, 0)), phenomenonTime, resultTime)"
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStreamTable {
    name: String,
}

impl DataStreamTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl StoreTable for DataStreamTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity(&self) -> Entity {
        Entity::DataStream
    }

    fn create_statements(&self) -> Vec<String> {
        let t = &self.name;
        vec![
            format!("CREATE TABLE {t} (id BIGSERIAL PRIMARY KEY, data JSONB)"),
            format!("CREATE INDEX {t}_output_name_idx ON {t} ((data->>'outputName'))"),
            format!(
                "CREATE INDEX {t}_system_id_idx ON {t} \
                 (((data->'system@id'->'internalID'->>'id')::bigint))"
            ),
            format!("CREATE INDEX {t}_data_idx ON {t} USING GIN (data)"),
        ]
    }
}

/// Features of interest and systems share this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTable {
    name: String,
    entity: Entity,
}

impl FeatureTable {
    pub fn foi(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: Entity::Foi,
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: Entity::System,
        }
    }

    /// Bounding box of all geometries as `BOX(xmin ymin,xmax ymax)` text,
    /// NULL on an empty table.
    pub fn extent(&self) -> String {
        format!("SELECT ST_Extent(geometry)::text AS extent FROM {}", self.name)
    }
}

impl StoreTable for FeatureTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity(&self) -> Entity {
        self.entity
    }

    fn create_statements(&self) -> Vec<String> {
        let t = &self.name;
        vec![
            "CREATE EXTENSION IF NOT EXISTS postgis".to_string(),
            "CREATE EXTENSION IF NOT EXISTS pg_trgm".to_string(),
            format!(
                "CREATE TABLE {t} (id BIGSERIAL, parentid bigint, geometry GEOMETRY, \
                 validTime VARCHAR, data JSONB, PRIMARY KEY (id, validTime))"
            ),
            format!("CREATE INDEX {t}_geometry_idx ON {t} USING GIST (geometry)"),
            format!(
                "CREATE INDEX {t}_uid_idx ON {t} ((data->'properties'->>'uid'), validTime)"
            ),
            format!(
                "CREATE INDEX {t}_valid_time_0_idx ON {t} \
                 (((data->'properties'->'validTime'->>0)::text))"
            ),
            format!(
                "CREATE INDEX {t}_valid_time_1_idx ON {t} \
                 (((data->'properties'->'validTime'->>1)::text))"
            ),
            format!(
                "CREATE INDEX {t}_description_trgm_idx ON {t} \
                 USING GIN ((data->'properties'->>'description') gin_trgm_ops)"
            ),
        ]
    }
}
