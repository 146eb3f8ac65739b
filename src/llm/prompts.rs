//! Fixed prompts for the OCR stages.
//!
//! The wording is part of the platform's contract with downstream parsing:
//! the extraction prompt pins the exact six-field pipe format that
//! consumers of `raw_text` and `boosted_text` rely on. Treat these as
//! opaque inputs; tuning them is a business-rule change, not a code change.

/// Prompt for the line-count stage: the model returns the number of data
/// rows on the page as a bare integer.
pub const LINE_COUNT: &str = "\
Cette image est une page de l'index aux immeubles du Registre foncier du Québec.
Compte le nombre de lignes d'inscriptions (rangées de données) dans le tableau.
Ne compte pas les en-têtes de colonnes ni les lignes vides.
Réponds uniquement avec le nombre, sans aucun autre texte.";

/// Prompt for the extraction stage: one pipe-delimited row per
/// inscription, six fields, `null` for empty values.
pub const EXTRACT: &str = "\
Cette image est une page de l'index aux immeubles du Registre foncier du Québec.
Transcris chaque ligne d'inscription du tableau, une ligne de sortie par inscription,
au format exact suivant (exactement cinq caractères `|` par ligne, six champs):

PARTIES | NATURE | DATE | NUM_PUB | RADIATION | REMARQUES

Règles:
- PARTIES: tous les noms de parties de la ligne, séparés par `;`.
- NATURE: la nature de l'acte telle qu'écrite (Vente, Hypothèque, Servitude, ...).
- DATE: la date de présentation au format AAAA-MM-JJ si lisible, sinon telle qu'écrite.
- NUM_PUB: le numéro de publication.
- RADIATION: la mention de radiation si présente.
- REMARQUES: toute remarque, suivie de tes annotations de confiance au format
  [conf:champ=haute|moyenne|basse] pour chaque champ difficile à lire.
- Champ vide ou illisible: écris exactement `null`.
- Aucune ligne d'en-tête, aucun commentaire, aucune numérotation.";

/// Build the boost prompt: a second pass over the raw extraction with
/// domain correction rules.
pub fn boost(raw_extraction: &str) -> String {
    format!(
        "\
Voici la transcription brute d'une page de l'index aux immeubles du Registre
foncier du Québec. Corrige-la en appliquant ces règles, sans changer le format:

- Normalise les noms de parties (MAJUSCULES pour les noms de famille,
  corrige les coquilles évidentes de l'OCR: 0/O, 1/I, 5/S).
- Normalise la NATURE vers le vocabulaire du registre (Vente, Hypothèque,
  Quittance, Servitude, Déclaration de transmission, Préavis d'exercice).
- Les dates deviennent AAAA-MM-JJ quand l'année est sans ambiguïté.
- Un NUM_PUB est toujours numérique; retire les espaces et lettres parasites.
- Conserve exactement cinq `|` par ligne et le littéral `null` pour les
  champs vides. Ne fusionne pas et ne supprime pas de lignes.
- Mets à jour les annotations [conf:...] si ta correction lève un doute.

Transcription brute:
{raw_extraction}",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_prompt_pins_field_order() {
        assert!(EXTRACT.contains("PARTIES | NATURE | DATE | NUM_PUB | RADIATION | REMARQUES"));
        assert!(EXTRACT.contains("`null`"));
    }

    #[test]
    fn test_boost_prompt_embeds_raw_text() {
        let prompt = boost("A | Vente | 2001-03-04 | 123 | null | null");
        assert!(prompt.contains("A | Vente | 2001-03-04 | 123 | null | null"));
        assert!(prompt.contains("cinq `|`"));
    }
}
