//! Diesel table definitions.

diesel::table! {
    tenant_deployments (tenant_id) {
        tenant_id -> Varchar,
        run_id -> Uuid,
        status -> Varchar,
        tier -> Varchar,
        record -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
