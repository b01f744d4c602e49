use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use super::field::{Access, FieldDef, FieldValue, Getter, Setter};
use super::{Entity, EntityMetadata};
use crate::core::{Error, Result, ValueType};

/// Flags attached to a declared field.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldOptions {
    primary_key: bool,
    defaultable: bool,
}

impl FieldOptions {
    pub fn primary_key(&mut self) -> &mut Self {
        self.primary_key = true;
        self
    }

    pub fn defaultable(&mut self) -> &mut Self {
        self.defaultable = true;
        self
    }
}

enum Declared<T> {
    Field(FieldDef<T>),
    Getter {
        value_type: ValueType,
        nullable: bool,
        getter: Getter<T>,
    },
    Setter {
        value_type: ValueType,
        setter: Setter<T>,
    },
}

struct Declaration<T> {
    key: String,
    declared: Declared<T>,
    options: FieldOptions,
}

/// Collects the field declarations of entity `T`.
///
/// Conflicts are recorded as they are declared and reported together by
/// [`EntityBuilder::build`].
pub struct EntityBuilder<T> {
    declarations: Vec<Declaration<T>>,
    errors: Vec<String>,
}

impl<T: Entity> EntityBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            declarations: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Map `key` to a struct field reached through `get` and `get_mut`.
    pub fn field<V, G, M>(&mut self, key: &str, get: G, get_mut: M) -> &mut FieldOptions
    where
        V: FieldValue,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        let def = FieldDef {
            key: key.to_lowercase(),
            value_type: V::VALUE_TYPE,
            nullable: V::NULLABLE,
            primary_key: false,
            defaultable: false,
            access: Access::Field,
            getter: Arc::new(move |entity: &T| get(entity).to_value()),
            setter: Arc::new(move |entity: &mut T, value| {
                *get_mut(entity) = V::from_value(value)?;
                Ok(())
            }),
        };
        self.push(key, Declared::Field(def))
    }

    /// Read half of a property. Pair it with [`EntityBuilder::setter`].
    pub fn getter<V, G>(&mut self, key: &str, get: G) -> &mut FieldOptions
    where
        V: FieldValue,
        G: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.push(
            key,
            Declared::Getter {
                value_type: V::VALUE_TYPE,
                nullable: V::NULLABLE,
                getter: Arc::new(move |entity: &T| get(entity).to_value()),
            },
        )
    }

    /// Write half of a property. Pair it with [`EntityBuilder::getter`].
    pub fn setter<V, S>(&mut self, key: &str, set: S) -> &mut FieldOptions
    where
        V: FieldValue,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.push(
            key,
            Declared::Setter {
                value_type: V::VALUE_TYPE,
                setter: Arc::new(move |entity: &mut T, value| {
                    set(entity, V::from_value(value)?);
                    Ok(())
                }),
            },
        )
    }

    /// Embed the fields of base entity `B`, reached through `project`.
    ///
    /// The base's fields are declared at the point of the call, so calling
    /// this first lets the base claim its keys before the subtype.
    pub fn inherit<B, P, M>(&mut self, project: P, project_mut: M)
    where
        B: Entity,
        P: Fn(&T) -> &B + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut B + Send + Sync + 'static,
    {
        let base = match EntityMetadata::<B>::describe() {
            Ok(base) => base,
            Err(err) => {
                self.errors.push(err.to_string());
                return;
            }
        };

        let project = Arc::new(project);
        let project_mut = Arc::new(project_mut);

        for def in base.into_fields() {
            let options = FieldOptions {
                primary_key: def.primary_key,
                defaultable: def.defaultable,
            };
            let getter = def.getter;
            let setter = def.setter;
            let project = Arc::clone(&project);
            let project_mut = Arc::clone(&project_mut);

            let lifted = FieldDef {
                key: def.key.clone(),
                value_type: def.value_type,
                nullable: def.nullable,
                primary_key: def.primary_key,
                defaultable: def.defaultable,
                access: def.access,
                getter: Arc::new(move |entity: &T| getter(project(entity))),
                setter: Arc::new(move |entity: &mut T, value| setter(project_mut(entity), value)),
            };

            let key = lifted.key.clone();
            *self.push(&key, Declared::Field(lifted)) = options;
        }
    }

    fn push(&mut self, key: &str, declared: Declared<T>) -> &mut FieldOptions {
        self.declarations.push(Declaration {
            key: key.to_lowercase(),
            declared,
            options: FieldOptions::default(),
        });
        let last = self.declarations.len() - 1;
        &mut self.declarations[last].options
    }

    pub(crate) fn build(self) -> Result<EntityMetadata<T>> {
        let entity = T::entity_name();
        let mut errors = self.errors;
        let mut fields: BTreeMap<String, FieldDef<T>> = BTreeMap::new();
        let mut getters: BTreeMap<String, (ValueType, bool, Getter<T>, FieldOptions)> = BTreeMap::new();
        let mut setters: BTreeMap<String, (ValueType, Setter<T>, FieldOptions)> = BTreeMap::new();

        for Declaration { key, declared, options } in self.declarations {
            match declared {
                Declared::Field(mut def) => {
                    def.primary_key |= options.primary_key;
                    def.defaultable |= options.defaultable;
                    match fields.entry(key) {
                        Entry::Vacant(slot) => {
                            slot.insert(def);
                        }
                        Entry::Occupied(slot) => errors.push(format!(
                            "{}: field '{}' is declared more than once",
                            entity,
                            slot.key()
                        )),
                    }
                }
                Declared::Getter { value_type, nullable, getter } => {
                    if getters.insert(key.clone(), (value_type, nullable, getter, options)).is_some() {
                        errors.push(format!("{}: getter '{}' is declared more than once", entity, key));
                    }
                }
                Declared::Setter { value_type, setter } => {
                    if setters.insert(key.clone(), (value_type, setter, options)).is_some() {
                        errors.push(format!("{}: setter '{}' is declared more than once", entity, key));
                    }
                }
            }
        }

        for (key, (value_type, nullable, getter, get_options)) in getters {
            let Some((set_type, setter, set_options)) = setters.remove(&key) else {
                errors.push(format!("{}: property '{}' has a getter but no setter", entity, key));
                continue;
            };
            if set_type != value_type {
                errors.push(format!(
                    "{}: property '{}' getter type {} does not match setter type {}",
                    entity, key, value_type, set_type
                ));
                continue;
            }
            if fields.contains_key(&key) {
                errors.push(format!(
                    "{}: property '{}' conflicts with a field of the same name",
                    entity, key
                ));
                continue;
            }

            fields.insert(
                key.clone(),
                FieldDef {
                    key,
                    value_type,
                    nullable,
                    primary_key: get_options.primary_key || set_options.primary_key,
                    defaultable: get_options.defaultable || set_options.defaultable,
                    access: Access::Property,
                    getter,
                    setter,
                },
            );
        }

        for key in setters.into_keys() {
            errors.push(format!("{}: property '{}' has a setter but no getter", entity, key));
        }

        if !errors.is_empty() {
            return Err(Error::Configuration(errors.join("; ")));
        }

        Ok(EntityMetadata::new(entity, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[derive(Debug, Default)]
    struct Named {
        name: String,
    }

    impl Entity for Named {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.field("NAME", |e: &Named| &e.name, |e: &mut Named| &mut e.name);
        }
    }

    #[derive(Debug, Default)]
    struct Account {
        base: Named,
        id: i64,
        balance_cents: i64,
    }

    impl Entity for Account {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.inherit(|e: &Account| &e.base, |e: &mut Account| &mut e.base);
            builder
                .field("id", |e: &Account| &e.id, |e: &mut Account| &mut e.id)
                .primary_key();
            builder.getter("balance", |e: &Account| e.balance_cents as f64 / 100.0);
            builder.setter("balance", |e: &mut Account, v: f64| {
                e.balance_cents = (v * 100.0).round() as i64
            });
        }
    }

    #[test]
    fn test_build_fields_and_properties() {
        let meta = EntityMetadata::<Account>::describe().unwrap();
        let keys: Vec<&str> = meta.keys().collect();
        assert_eq!(keys, vec!["balance", "id", "name"]);

        let id = meta.get("id").unwrap();
        assert!(id.is_primary_key());
        assert_eq!(id.access(), Access::Field);
        assert_eq!(meta.get("balance").unwrap().access(), Access::Property);

        let mut account = Account::default();
        meta.get("name").unwrap().set(&mut account, Value::from("Ops")).unwrap();
        meta.get("balance").unwrap().set(&mut account, Value::Double(12.5)).unwrap();
        assert_eq!(account.base.name, "Ops");
        assert_eq!(account.balance_cents, 1250);
        assert_eq!(meta.get("name").unwrap().get(&account), Value::from("Ops"));
    }

    #[derive(Debug, Default)]
    struct Clashing {
        name: String,
        label: String,
    }

    impl Entity for Clashing {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.field("name", |e: &Clashing| &e.name, |e: &mut Clashing| &mut e.name);
            builder.getter("name", |e: &Clashing| e.label.clone());
            builder.setter("name", |e: &mut Clashing, v: String| e.label = v);
        }
    }

    #[test]
    fn test_field_and_property_conflict() {
        let err = EntityMetadata::<Clashing>::describe().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("conflicts"));
    }

    #[derive(Debug, Default)]
    struct Mismatched {
        count: i64,
    }

    impl Entity for Mismatched {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.getter("count", |e: &Mismatched| e.count);
            builder.setter("count", |e: &mut Mismatched, v: String| {
                e.count = v.len() as i64
            });
        }
    }

    #[test]
    fn test_property_type_mismatch() {
        let err = EntityMetadata::<Mismatched>::describe().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
