use i18n_embed::{
    fluent::{fluent_language_loader, FluentLanguageLoader},
    unic_langid::LanguageIdentifier,
    DefaultLocalizer, LanguageLoader, Localizer,
};
use lazy_static::lazy_static;
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "i18n"]
struct Translations;

const TRANSLATIONS: Translations = Translations {};

lazy_static! {
    pub(crate) static ref LANGUAGE_LOADER: FluentLanguageLoader = {
        let loader = fluent_language_loader!();
        // The fallback language must always be available, even if the host
        // application never calls `localizer().select(..)`.
        let fallback: LanguageIdentifier =
            "en-US".parse().expect("valid language identifier");
        loader
            .load_languages(&TRANSLATIONS, &[&fallback])
            .expect("fallback language is embedded");
        loader
    };
}

/// Returns the [`Localizer`] to be used for localizing this library.
pub fn localizer() -> Box<dyn Localizer> {
    Box::from(DefaultLocalizer::new(&*LANGUAGE_LOADER, &TRANSLATIONS))
}
