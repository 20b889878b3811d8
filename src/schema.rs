// Diesel table definitions for the fixed-name tables.
// Stage status tables share one shape and are addressed through raw SQL
// keyed by `Stage::table()`.

diesel::table! {
    work_queue (seq) {
        seq -> BigInt,
        queue -> Text,
        entity_id -> BigInt,
        enqueued_at -> Text,
    }
}

diesel::table! {
    service_status (id) {
        id -> Text,
        service_type -> Text,
        status -> Text,
        last_heartbeat -> Text,
        last_activity -> Nullable<Text>,
        current_task -> Nullable<Text>,
        stats -> Text,
        started_at -> Text,
        host -> Nullable<Text>,
        version -> Nullable<Text>,
        last_error -> Nullable<Text>,
        last_error_at -> Nullable<Text>,
        error_count -> Integer,
    }
}

diesel::allow_tables_to_appear_in_same_query!(work_queue, service_status);
