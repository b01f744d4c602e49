use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, parse_macro_input, spanned::Spanned};

/// Implements `beanmap::Entity` for a struct with named fields.
///
/// Every field is mapped under its own name unless told otherwise:
///
/// - `#[column(name = "...")]` maps it under another column key
/// - `#[column(primary_key)]`, `#[column(defaultable)]` set the flags
/// - `#[column(skip)]` leaves the field unmapped
/// - `#[inherit]` embeds the fields of another entity
/// - `#[entity(name = "...")]` on the struct sets the name used in errors
#[proc_macro_derive(Entity, attributes(column, inherit, entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct ColumnOptions {
    name: Option<String>,
    primary_key: bool,
    defaultable: bool,
    skip: bool,
    inherit: bool,
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "#[derive(Entity)] can only be used on structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new(
            data.fields.span(),
            "#[derive(Entity)] requires a struct with named fields",
        ));
    };

    let mut inherited = Vec::new();
    let mut declared = Vec::new();

    for field in &fields.named {
        let Some(ident) = &field.ident else {
            continue;
        };
        let ty = &field.ty;
        let options = parse_column_options(&field.attrs)?;

        if options.inherit {
            inherited.push(quote! {
                builder.inherit::<#ty, _, _>(
                    |entity: &Self| &entity.#ident,
                    |entity: &mut Self| &mut entity.#ident,
                );
            });
            continue;
        }
        if options.skip {
            continue;
        }

        let key = options.name.unwrap_or_else(|| ident.to_string());
        let primary_key = options.primary_key.then(|| quote!(.primary_key()));
        let defaultable = options.defaultable.then(|| quote!(.defaultable()));
        declared.push(quote! {
            builder
                .field(
                    #key,
                    |entity: &Self| &entity.#ident,
                    |entity: &mut Self| &mut entity.#ident,
                )
                #primary_key
                #defaultable;
        });
    }

    let entity_name = parse_entity_name(&input.attrs)?.map(|name| {
        quote! {
            fn entity_name() -> &'static str {
                #name
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::beanmap::entity::Entity for #struct_name #ty_generics #where_clause {
            fn describe(builder: &mut ::beanmap::entity::EntityBuilder<Self>) {
                #(#inherited)*
                #(#declared)*
            }

            #entity_name
        }
    })
}

fn parse_column_options(attrs: &[syn::Attribute]) -> syn::Result<ColumnOptions> {
    let mut options = ColumnOptions::default();
    let mut seen_column = false;

    for attr in attrs {
        if attr.path().is_ident("inherit") {
            if !matches!(attr.meta, syn::Meta::Path(_)) {
                return Err(syn::Error::new(attr.span(), "#[inherit] does not accept arguments"));
            }
            options.inherit = true;
            continue;
        }

        if !attr.path().is_ident("column") {
            continue;
        }
        if seen_column {
            return Err(syn::Error::new(
                attr.span(),
                "Duplicate #[column(...)] attribute on field",
            ));
        }
        seen_column = true;

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                options.name = Some(lit.value());
                return Ok(());
            }

            if meta.path.is_ident("primary_key") {
                options.primary_key = true;
                return Ok(());
            }

            if meta.path.is_ident("defaultable") {
                options.defaultable = true;
                return Ok(());
            }

            if meta.path.is_ident("skip") {
                options.skip = true;
                return Ok(());
            }

            Err(meta.error(
                "Unsupported #[column(...)] option. Supported: name = \"...\", primary_key, defaultable, skip",
            ))
        })?;
    }

    if options.inherit && seen_column {
        return Err(syn::Error::new(
            attrs[0].span(),
            "#[inherit] fields cannot also carry #[column(...)]",
        ));
    }

    Ok(options)
}

fn parse_entity_name(attrs: &[syn::Attribute]) -> syn::Result<Option<String>> {
    let mut name = None;

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                name = Some(lit.value());
                return Ok(());
            }

            Err(meta.error("Unsupported #[entity(...)] option. Supported: name = \"...\""))
        })?;
    }

    Ok(name)
}
