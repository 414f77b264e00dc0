// Table definitions kept in sync with migrations/ by hand; the telemetry
// tables are TimescaleDB hypertables with composite primary keys.

pub mod sql_types {
    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "kit_source"))]
    pub struct KitSource;

    #[derive(diesel::query_builder::QueryId, diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "kit_status"))]
    pub struct KitStatus;
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::{KitSource, KitStatus};

    kits (kit_id) {
        kit_id -> Text,
        name -> Text,
        location -> Nullable<Text>,
        api_url -> Nullable<Text>,
        source -> KitSource,
        enabled -> Bool,
        disabled_by_admin -> Bool,
        status -> KitStatus,
        last_seen -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tracks (time, kit_id, drone_id) {
        time -> Timestamptz,
        kit_id -> Text,
        drone_id -> Text,
        track_type -> Text,
        lat -> Nullable<Float8>,
        lon -> Nullable<Float8>,
        alt -> Nullable<Float8>,
        speed -> Nullable<Float8>,
        heading -> Nullable<Float8>,
        vspeed -> Nullable<Float8>,
        height -> Nullable<Float8>,
        direction -> Nullable<Float8>,
        operator_id -> Nullable<Text>,
        caa_id -> Nullable<Text>,
        rid_make -> Nullable<Text>,
        rid_model -> Nullable<Text>,
        rid_source -> Nullable<Text>,
        pilot_lat -> Nullable<Float8>,
        pilot_lon -> Nullable<Float8>,
        home_lat -> Nullable<Float8>,
        home_lon -> Nullable<Float8>,
        mac -> Nullable<Text>,
        rssi -> Nullable<Float8>,
        freq_mhz -> Nullable<Float8>,
    }
}

diesel::table! {
    signals (time, kit_id, freq_mhz) {
        time -> Timestamptz,
        kit_id -> Text,
        freq_mhz -> Float8,
        power_dbm -> Nullable<Float8>,
        bandwidth_mhz -> Nullable<Float8>,
        lat -> Nullable<Float8>,
        lon -> Nullable<Float8>,
        detection_type -> Text,
        stage -> Text,
        pal_confidence -> Nullable<Float8>,
        ntsc_confidence -> Nullable<Float8>,
    }
}

diesel::table! {
    kit_health (time, kit_id) {
        time -> Timestamptz,
        kit_id -> Text,
        lat -> Nullable<Float8>,
        lon -> Nullable<Float8>,
        alt -> Nullable<Float8>,
        cpu_percent -> Nullable<Float8>,
        memory_percent -> Nullable<Float8>,
        disk_percent -> Nullable<Float8>,
        uptime_hours -> Nullable<Float8>,
        temp_cpu -> Nullable<Float8>,
        temp_gpu -> Nullable<Float8>,
        temp_sdr -> Nullable<Float8>,
        gps_speed -> Nullable<Float8>,
        gps_track -> Nullable<Float8>,
        gps_fix -> Nullable<Bool>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(kits, tracks, signals, kit_health);
