//! Diesel schema for the stacktach tables. Timestamp columns hold epoch microseconds.

diesel::table! {
    use diesel::sql_types::*;

    deployments (id) {
        id -> Int8,
        name -> Text,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    raw_records (id) {
        id -> Int8,
        deployment_id -> Int8,
        routing_key -> Text,
        event -> Text,
        publisher -> Nullable<Text>,
        service -> Nullable<Text>,
        host -> Nullable<Text>,
        when_at -> Nullable<Int8>,
        tenant -> Nullable<Text>,
        instance -> Nullable<Text>,
        request_id -> Nullable<Text>,
        state -> Nullable<Text>,
        old_state -> Nullable<Text>,
        task -> Nullable<Text>,
        old_task -> Nullable<Text>,
        image_type -> Int4,
        json -> Text,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    lifecycles (id) {
        id -> Int8,
        instance -> Text,
        last_raw_id -> Nullable<Int8>,
        last_state -> Nullable<Text>,
        last_task_state -> Nullable<Text>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    timings (id) {
        id -> Int8,
        lifecycle_id -> Int8,
        name -> Text,
        start_raw_id -> Nullable<Int8>,
        end_raw_id -> Nullable<Int8>,
        start_when -> Nullable<Int8>,
        end_when -> Nullable<Int8>,
        diff -> Nullable<Int8>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    request_trackers (id) {
        id -> Int8,
        request_id -> Text,
        lifecycle_id -> Int8,
        last_timing_id -> Nullable<Int8>,
        start_when -> Nullable<Int8>,
        duration -> Int8,
        completed -> Bool,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    instance_usages (id) {
        id -> Int8,
        instance -> Text,
        launched_at -> Nullable<Int8>,
        request_id -> Nullable<Text>,
        instance_type_id -> Nullable<Text>,
        instance_flavor_id -> Nullable<Text>,
        tenant -> Nullable<Text>,
        os_architecture -> Nullable<Text>,
        os_distro -> Nullable<Text>,
        os_version -> Nullable<Text>,
        rax_options -> Nullable<Text>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    instance_deletes (id) {
        id -> Int8,
        instance -> Text,
        launched_at -> Nullable<Int8>,
        deleted_at -> Nullable<Int8>,
        raw_id -> Nullable<Int8>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    instance_exists (id) {
        id -> Int8,
        instance -> Text,
        launched_at -> Nullable<Int8>,
        deleted_at -> Nullable<Int8>,
        audit_period_beginning -> Nullable<Int8>,
        audit_period_ending -> Nullable<Int8>,
        instance_type_id -> Nullable<Text>,
        instance_flavor_id -> Nullable<Text>,
        message_id -> Nullable<Text>,
        tenant -> Nullable<Text>,
        os_architecture -> Nullable<Text>,
        os_distro -> Nullable<Text>,
        os_version -> Nullable<Text>,
        rax_options -> Nullable<Text>,
        status -> Text,
        send_status -> Int4,
        fail_reason -> Nullable<Text>,
        raw_id -> Nullable<Int8>,
        usage_id -> Nullable<Int8>,
        delete_id -> Nullable<Int8>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    instance_reconciles (id) {
        id -> Int8,
        instance -> Text,
        launched_at -> Nullable<Int8>,
        deleted_at -> Nullable<Int8>,
        instance_type_id -> Nullable<Text>,
        instance_flavor_id -> Nullable<Text>,
        tenant -> Nullable<Text>,
        os_architecture -> Nullable<Text>,
        os_distro -> Nullable<Text>,
        os_version -> Nullable<Text>,
        rax_options -> Nullable<Text>,
        source -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    deployments,
    raw_records,
    lifecycles,
    timings,
    request_trackers,
    instance_usages,
    instance_deletes,
    instance_exists,
    instance_reconciles,
);
