//! Split a full address line into street, number, and complement.

use std::sync::LazyLock;

use regex::Regex;

use recordfill_shared::FieldKind;

use crate::cleanup::{tidy, tidy_keep_dot};

/// Number after a comma: `Rua 25 de Março, 100`.
static COMMA_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<street>.+?),\s*(?:n[º°o]?\.?\s*)?(?P<number>\d{1,6}[a-z]?|s/?n)\b(?P<rest>.*)$",
    )
    .expect("valid regex")
});

/// Number after whitespace: `Av. Paulista nº 1000`.
static SPACE_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<street>.+?)\s+(?:n[º°o]?\.?\s*)?(?P<number>\d{1,6}[a-z]?|s/?n)\b(?P<rest>.*)$",
    )
    .expect("valid regex")
});

pub(crate) static COMPLEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:sala|sl\.|salas|bloco|bl\.|apto?\.?|apartamento|conjunto|conj\.|cj\.?|loja|andar|casa)\s*[^,\n;]{1,40}",
    )
    .expect("valid regex")
});

/// Parts of an address line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressParts {
    pub street: String,
    pub number: Option<String>,
    pub complement: Option<String>,
}

/// Split `Rua Augusta, 100 - Sala 12` into its street, number, and complement.
///
/// Lines without a recognisable number come back whole in `street`.
pub fn split_address(line: &str) -> AddressParts {
    let line = line.trim();
    let Some(caps) = COMMA_SPLIT_RE
        .captures(line)
        .or_else(|| SPACE_SPLIT_RE.captures(line))
    else {
        return AddressParts {
            street: tidy(line, FieldKind::Address),
            ..AddressParts::default()
        };
    };

    let street = tidy(&caps["street"], FieldKind::Address);
    let number = caps["number"].to_uppercase();
    let complement = caps
        .name("rest")
        .and_then(|rest| COMPLEMENT_RE.find(rest.as_str()))
        .map(|m| tidy_keep_dot(m.as_str(), FieldKind::Complement))
        .filter(|c| !c.is_empty());

    AddressParts {
        street,
        number: Some(number),
        complement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_street_number_and_complement() {
        let parts = split_address("Rua Augusta, 100 - Sala 12");
        assert_eq!(parts.street, "Rua Augusta");
        assert_eq!(parts.number.as_deref(), Some("100"));
        assert_eq!(parts.complement.as_deref(), Some("Sala 12"));
    }

    #[test]
    fn handles_number_markers_and_missing_complement() {
        let parts = split_address("Av. Paulista nº 1000");
        assert_eq!(parts.street, "Av. Paulista");
        assert_eq!(parts.number.as_deref(), Some("1000"));
        assert_eq!(parts.complement, None);

        let parts = split_address("Rua das Flores, s/n");
        assert_eq!(parts.number.as_deref(), Some("S/N"));

        let parts = split_address("Rua 25 de Março, 300, Loja 4");
        assert_eq!(parts.street, "Rua 25 de Março");
        assert_eq!(parts.number.as_deref(), Some("300"));
        assert_eq!(parts.complement.as_deref(), Some("Loja 4"));
    }

    #[test]
    fn line_without_number_is_kept_whole() {
        let parts = split_address("Rua das Flores");
        assert_eq!(parts.street, "Rua das Flores");
        assert_eq!(parts.number, None);
    }
}
