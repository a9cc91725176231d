use crate::attribute::Attribute;
use crate::content_type::ContentType;
use crate::entity::Entity;
use crate::options::SaveOptions;
use crate::value::Value;

/// Compute the state to persist from the stored state and an update.
///
/// Identity comes from `existing` when there is one. The attribute set and
/// per-language values follow the policies in `options`; `filter` restricts
/// the result to declared attributes unless unknown attributes are kept.
pub fn create_merged_for_saving(
    existing: Option<&Entity>,
    incoming: &Entity,
    filter: Option<&ContentType>,
    options: &SaveOptions,
) -> Entity {
    let identity = existing.unwrap_or(incoming);

    let mut attributes: Vec<Attribute> = Vec::new();
    match existing {
        Some(existing) if options.preserve_existing_attributes => {
            for old in existing.attributes().values() {
                match incoming.attribute(&old.name) {
                    Some(new) => attributes.push(merge_attribute(Some(old), new, options)),
                    None => attributes.push(old.clone()),
                }
            }
            for new in incoming.attributes().values() {
                if !existing.has_attribute(&new.name) {
                    attributes.push(merge_attribute(None, new, options));
                }
            }
        }
        _ => {
            for new in incoming.attributes().values() {
                let old = existing.and_then(|e| e.attribute(&new.name));
                attributes.push(merge_attribute(old, new, options));
            }
        }
    }

    if let Some(ct) = filter {
        if !options.preserve_unknown_attributes {
            attributes.retain(|a| ct.has_attribute(&a.name));
        }
    }

    let mut builder = identity.to_builder();
    if let Some(ct) = incoming.content_type().or(existing.and_then(Entity::content_type)) {
        builder = builder.content_type(ct);
    }
    let title = incoming
        .title_field()
        .or(existing.and_then(Entity::title_field));
    if let Some(title) = title {
        builder = builder.title_field(title);
    }
    builder.build().with_attributes(attributes)
}

fn merge_attribute(existing: Option<&Attribute>, incoming: &Attribute, options: &SaveOptions) -> Attribute {
    let incoming_values = strip_unknown_languages(&incoming.values, options);
    let Some(existing) = existing else {
        return Attribute::with_values(&incoming.name, incoming.attr_type, incoming_values);
    };

    let mut placed = vec![false; incoming_values.len()];
    let mut values = Vec::new();
    for old in &existing.values {
        // an unconditional value is always superseded
        if old.languages.is_empty() {
            continue;
        }
        match incoming_values.iter().position(|new| new.shares_language_with(old)) {
            Some(i) => {
                if !placed[i] {
                    placed[i] = true;
                    values.push(incoming_values[i].clone());
                }
            }
            None if options.preserve_unknown_languages => values.push(old.clone()),
            None => {}
        }
    }
    for (value, done) in incoming_values.into_iter().zip(placed) {
        if !done {
            values.push(value);
        }
    }
    Attribute::with_values(&incoming.name, incoming.attr_type, values)
}

fn strip_unknown_languages(values: &[Value], options: &SaveOptions) -> Vec<Value> {
    if options.preserve_unknown_languages {
        return values.to_vec();
    }
    values
        .iter()
        .filter_map(|value| {
            if value.languages.is_empty() {
                return Some(value.clone());
            }
            let languages: Vec<_> = value
                .languages
                .iter()
                .filter(|l| options.is_known_language(&l.key))
                .cloned()
                .collect();
            (!languages.is_empty()).then(|| value.clone().with_languages(languages))
        })
        .collect()
}
