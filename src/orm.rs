#[allow(warnings, clippy::all)]
pub(crate) mod qr_code {
    use sea_orm::entity::prelude::*;

    #[sea_orm::model]
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "qr_codes")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub short_id: String,
        #[sea_orm(column_type = "Text")]
        pub original_url: String,
        pub color: String,
        pub format: String,
        pub created_at: TimeDateTimeWithTimeZone,
        pub updated_at: TimeDateTimeWithTimeZone,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
