//! Entity fixtures shared by unit tests.

use unitwork_core::{
    AssociationInfo, AssociationKind, AssociationValue, CascadeStyle, Entity, EntityRef,
    FieldInfo, LinkTableInfo, Result, Row, SqlType, ToMany, ToOne, Value, entity_ref,
};

#[derive(Debug, Clone)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub heroes: ToMany<Hero>,
}

#[derive(Debug, Clone)]
pub struct Hero {
    pub id: i64,
    pub name: String,
    pub team: ToOne<Team>,
    pub powers: ToMany<Power>,
}

#[derive(Debug, Clone)]
pub struct Power {
    pub id: i64,
    pub name: String,
}

const TEAM_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text),
    FieldInfo::new("version", "version", SqlType::BigInt).version(true),
];

const TEAM_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "heroes",
    "Hero",
    "heroes",
    AssociationKind::OneToMany,
)
.remote_key("team_id")
.mapped_by("team")
.cascade(CascadeStyle::ALL_DELETE_ORPHAN)];

const HERO_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text),
    FieldInfo::new("team_id", "team_id", SqlType::BigInt)
        .nullable(true)
        .foreign_key("teams.id"),
];

const HERO_ASSOCIATIONS: &[AssociationInfo] = &[
    AssociationInfo::new("team", "Team", "teams", AssociationKind::ManyToOne)
        .local_key("team_id")
        .cascade(CascadeStyle::PERSIST),
    AssociationInfo::new("powers", "Power", "powers", AssociationKind::ManyToMany)
        .link_table(LinkTableInfo::new("hero_powers", "hero_id", "power_id"))
        .cascade(CascadeStyle::PERSIST),
];

const POWER_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
    FieldInfo::new("name", "name", SqlType::Text).natural_id(true),
];

impl Entity for Team {
    const ENTITY_NAME: &'static str = "Team";
    const TABLE_NAME: &'static str = "teams";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        TEAM_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        TEAM_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("version", Value::BigInt(self.version)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Team {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            version: row.get_named("version")?,
            heroes: ToMany::uninitialized(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn set_version(&mut self, version: &Value) {
        if let Some(v) = version.as_i64() {
            self.version = v;
        }
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "heroes" => Some(&self.heroes),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "heroes" => Some(&mut self.heroes),
            _ => None,
        }
    }
}

impl Entity for Hero {
    const ENTITY_NAME: &'static str = "Hero";
    const TABLE_NAME: &'static str = "heroes";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        HERO_FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        HERO_ASSOCIATIONS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("team_id", self.team.id_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Hero {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team: ToOne::from_id(row.get_named::<Value>("team_id")?),
            powers: ToMany::uninitialized(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }

    fn association(&self, name: &str) -> Option<&dyn AssociationValue> {
        match name {
            "team" => Some(&self.team),
            "powers" => Some(&self.powers),
            _ => None,
        }
    }

    fn association_mut(&mut self, name: &str) -> Option<&mut dyn AssociationValue> {
        match name {
            "team" => Some(&mut self.team),
            "powers" => Some(&mut self.powers),
            _ => None,
        }
    }
}

impl Entity for Power {
    const ENTITY_NAME: &'static str = "Power";
    const TABLE_NAME: &'static str = "powers";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        POWER_FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Power {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

pub fn team(id: i64, name: &str) -> EntityRef<Team> {
    entity_ref(Team {
        id,
        name: name.to_string(),
        version: 0,
        heroes: ToMany::new(),
    })
}

pub fn hero(id: i64, name: &str) -> EntityRef<Hero> {
    entity_ref(Hero {
        id,
        name: name.to_string(),
        team: ToOne::empty(),
        powers: ToMany::new(),
    })
}

pub fn power(id: i64, name: &str) -> EntityRef<Power> {
    entity_ref(Power {
        id,
        name: name.to_string(),
    })
}
